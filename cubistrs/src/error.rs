use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CubistError>;

#[derive(Debug, Error)]
pub enum CubistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    /// Structural defect in the logical or physical model.
    #[error("model error: {0}")]
    Model(String),
    #[error("no such cube: {0}")]
    NoSuchCube(String),
    #[error("no such dimension: {0}")]
    NoSuchDimension(String),
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),
    /// A dependency names an attribute missing from the dependency map.
    #[error("unknown attribute '{0}' in dependency map")]
    UnknownAttribute(String),
    #[error("circular attribute dependency: {}", .attributes.join(", "))]
    CircularDependency { attributes: Vec<String> },
    #[error("argument error: {0}")]
    Argument(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CubistError {
    /// True for errors caused by an unknown name in a request rather than a model defect.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            CubistError::NoSuchCube(_)
                | CubistError::NoSuchDimension(_)
                | CubistError::NoSuchAttribute(_)
        )
    }
}
