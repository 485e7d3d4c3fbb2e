//! # riskgate-core
//!
//! Behavioral risk-scoring pipeline for per-user activity events.
//!
//! This crate takes raw activity events (logins, actions, transactions),
//! normalizes them, extracts velocity and behavior-deviation features,
//! scores the feature vector against an isolation-forest anomaly model,
//! and emits a calibrated [`risk::RiskAssessment`] with an allow/flag/block
//! decision per event. Per-user state (profiles, velocity windows) is
//! sharded across pipeline workers; the model and configuration are
//! hot-swappable behind atomic snapshot reads.

pub mod audit;
pub mod behavioral;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod pipeline;
pub mod risk;
pub mod velocity;

pub use error::{Result, ScoreError};
