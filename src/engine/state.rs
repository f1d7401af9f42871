use crate::config::EngineConfig;
use crate::quality::ConnectionQuality;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    Realtime,
    Polling,
    Static,
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionMode::Realtime => "realtime",
            AcquisitionMode::Polling => "polling",
            AcquisitionMode::Static => "static",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    TransportFailure,
    ErrorBudget,
    ConsecutiveErrors,
    LowQuality,
    FallbackTimeout,
    Escalation,
    Recovery,
    Explicit,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransitionReason::TransportFailure => "realtime transport failed",
            TransitionReason::ErrorBudget => "error budget exhausted",
            TransitionReason::ConsecutiveErrors => "too many consecutive errors",
            TransitionReason::LowQuality => "connection quality too low",
            TransitionReason::FallbackTimeout => "realtime did not connect in time",
            TransitionReason::Escalation => "polling keeps failing",
            TransitionReason::Recovery => "connection recovered",
            TransitionReason::Explicit => "requested",
        })
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionState {
    pub mode: AcquisitionMode,
    pub is_connected: bool,
    pub error_count: u32,
    pub retry_count: u32,
    pub last_update: Option<DateTime<Utc>>,
    pub polling_started: Option<Instant>,
    pub startup_error: Option<String>,
}

impl AcquisitionState {
    pub fn new(mode: AcquisitionMode) -> Self {
        Self {
            mode,
            is_connected: false,
            error_count: 0,
            retry_count: 0,
            last_update: None,
            polling_started: None,
            startup_error: None,
        }
    }
}

/// Rules 1b-1d for leaving realtime. The score rule only runs on the periodic
/// quality check.
pub fn realtime_downgrade(
    state: &AcquisitionState,
    quality: &ConnectionQuality,
    config: &EngineConfig,
    check_score: bool,
) -> Option<TransitionReason> {
    if state.mode != AcquisitionMode::Realtime {
        return None;
    }
    if state.error_count >= config.max_error_count {
        return Some(TransitionReason::ErrorBudget);
    }
    if quality.consecutive_errors >= config.max_consecutive_errors {
        return Some(TransitionReason::ConsecutiveErrors);
    }
    if check_score && quality.score < config.min_connection_quality {
        return Some(TransitionReason::LowQuality);
    }
    None
}

pub fn should_escalate(state: &AcquisitionState, config: &EngineConfig) -> bool {
    state.mode == AcquisitionMode::Polling && state.error_count >= config.max_error_count
}

/// Strict gate for polling -> realtime. All conditions must hold, including
/// the minimum continuous polling dwell.
pub fn recovery_gate(
    state: &AcquisitionState,
    quality: &ConnectionQuality,
    config: &EngineConfig,
    now: Instant,
) -> bool {
    if state.mode != AcquisitionMode::Polling {
        return false;
    }
    let dwell_ok = state
        .polling_started
        .is_some_and(|started| now.duration_since(started) >= config.min_polling_dwell);

    dwell_ok
        && quality.score > config.min_connection_quality + config.recovery_score_margin
        && quality.consecutive_successes >= config.recovery_min_successes
        && quality.error_rate < config.recovery_max_error_rate
}
