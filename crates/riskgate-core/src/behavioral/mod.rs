//! User behavior profiling and deviation scoring.

pub mod profile;
pub mod profiler;

pub use profile::UserProfile;
pub use profiler::{BehaviorProfiler, DeviationVector};
