#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Prometheus label names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
    #[error("invalid global label name: {name:?}")]
    InvalidLabel { name: String },
    #[cfg(feature = "prometheus")]
    #[error(transparent)]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

pub type Result<T> = std::result::Result<T, Error>;
