pub mod vote_simulator;
