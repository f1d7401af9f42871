use chrono::{DateTime, Utc};
use serde::Serialize;

const SUCCESS_DECAY: f64 = 0.1;
const FAILURE_GROWTH: f64 = 0.2;
const RESPONSE_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionQuality {
    pub score: f64,
    /// Last observed response time in milliseconds.
    pub latency: Option<f64>,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub error_rate: f64,
    pub average_response_time: f64,
    pub last_connection_time: Option<DateTime<Utc>>,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            score: 100.0,
            latency: None,
            consecutive_errors: 0,
            consecutive_successes: 0,
            error_rate: 0.0,
            average_response_time: 0.0,
            last_connection_time: None,
        }
    }
}

/// Score derived from the smoothed error rate and the current error streak.
pub fn score_for(error_rate: f64, consecutive_errors: u32) -> f64 {
    (100.0 - error_rate * 50.0 - consecutive_errors as f64 * 15.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionQualityTracker {
    quality: ConnectionQuality,
}

impl ConnectionQualityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quality(&self) -> &ConnectionQuality {
        &self.quality
    }

    pub fn record_sample(&mut self, success: bool, response_time_ms: Option<f64>) -> &ConnectionQuality {
        let q = &mut self.quality;
        if success {
            q.consecutive_errors = 0;
            q.consecutive_successes += 1;
            q.error_rate = (q.error_rate - SUCCESS_DECAY).max(0.0);
            q.last_connection_time = Some(Utc::now());
            if let Some(rt) = response_time_ms {
                q.average_response_time =
                    q.average_response_time * (1.0 - RESPONSE_WEIGHT) + rt * RESPONSE_WEIGHT;
                q.latency = Some(rt);
            }
        } else {
            q.consecutive_successes = 0;
            q.consecutive_errors += 1;
            q.error_rate = (q.error_rate + FAILURE_GROWTH).min(1.0);
        }
        q.score = score_for(q.error_rate, q.consecutive_errors);
        &self.quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_formula_holds_across_inputs() {
        for errors in 0..10u32 {
            for step in 0..=10 {
                let rate = step as f64 / 10.0;
                let expected = (100.0 - rate * 50.0 - errors as f64 * 15.0).clamp(0.0, 100.0);
                assert_eq!(score_for(rate, errors), expected);
            }
        }
        assert_eq!(score_for(1.0, 10), 0.0);
        assert_eq!(score_for(0.0, 0), 100.0);
    }

    #[test]
    fn failure_then_success_resets_counters() {
        let mut tracker = ConnectionQualityTracker::new();
        tracker.record_sample(false, None);
        let q = tracker.record_sample(false, None).clone();
        assert_eq!(q.consecutive_errors, 2);
        assert_eq!(q.consecutive_successes, 0);
        assert!((q.error_rate - 0.4).abs() < 1e-9);
        assert!((q.score - 50.0).abs() < 1e-9);
        assert!(q.last_connection_time.is_none());

        let q = tracker.record_sample(true, Some(100.0)).clone();
        assert_eq!(q.consecutive_errors, 0);
        assert_eq!(q.consecutive_successes, 1);
        assert!((q.error_rate - 0.3).abs() < 1e-9);
        assert!((q.score - 85.0).abs() < 1e-9);
        assert!(q.last_connection_time.is_some());
        assert_eq!(q.latency, Some(100.0));
    }

    #[test]
    fn error_rate_is_clamped() {
        let mut tracker = ConnectionQualityTracker::new();
        for _ in 0..10 {
            tracker.record_sample(false, None);
        }
        assert_eq!(tracker.quality().error_rate, 1.0);
        assert_eq!(tracker.quality().score, 0.0);

        for _ in 0..20 {
            tracker.record_sample(true, None);
        }
        assert_eq!(tracker.quality().error_rate, 0.0);
        assert_eq!(tracker.quality().score, 100.0);
    }

    #[test]
    fn response_time_is_smoothed_and_optional() {
        let mut tracker = ConnectionQualityTracker::new();
        tracker.record_sample(true, Some(500.0));
        assert!((tracker.quality().average_response_time - 100.0).abs() < 1e-9);
        tracker.record_sample(true, None);
        assert!((tracker.quality().average_response_time - 100.0).abs() < 1e-9);
        assert_eq!(tracker.quality().latency, Some(500.0));
        tracker.record_sample(true, Some(100.0));
        assert!((tracker.quality().average_response_time - 100.0).abs() < 1e-9);
    }
}
