pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`vus` must be a positive integer")]
    InvalidVus,

    #[error("`iterations` must be a positive integer")]
    InvalidIterations,

    #[error("`duration` must be a positive duration")]
    InvalidDuration,

    #[error("`stages` must be a non-empty array of {{ duration, target }}")]
    InvalidStages,

    #[error("`rate` must be a positive integer")]
    InvalidRate,

    #[error("`time_unit` must be a positive duration")]
    InvalidTimeUnit,

    #[error("`pre_allocated_vus` must be a positive integer")]
    InvalidPreAllocatedVus,

    #[error("`max_vus` must be >= `pre_allocated_vus`")]
    InvalidMaxVus,

    #[error("duplicate scenario name: `{0}`")]
    DuplicateScenario(String),

    #[error("scenario `{scenario}` references unknown exec function `{exec}`")]
    UnknownExec { scenario: String, exec: String },

    #[error("invalid threshold expression for metric `{metric}`: {error}")]
    InvalidThreshold { metric: String, error: String },

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
