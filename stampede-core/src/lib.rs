pub mod checks;
pub mod config;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod pacer;
mod run;
pub mod schedule;
pub mod stats;
pub mod thresholds;
pub mod transport;
pub mod vu;

pub use checks::Checks;
pub use config::{ExecutorConfig, ExecutorKind, RunOptions, ScenarioSpec, Stage, Threshold};
pub use error::{Error, Result};
pub use lifecycle::{RunReport, TestPlan};
pub use stats::RunStats;
pub use thresholds::{ThresholdOutcome, ThresholdVerdict};
pub use transport::{RecordingTransport, Request, Response, Transport, TransportError};
pub use vu::{IterationContext, IterationError, IterationResult};
