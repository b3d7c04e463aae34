use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("label mismatch for {metric}: expected {expected} label values, got {got}")]
    LabelMismatch {
        metric: String,
        expected: usize,
        got: usize,
    },

    #[error("Prometheus Error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("failed to list certificate requests: {0}")]
    List(#[source] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
