use thiserror::Error;

/// Errors surfaced by orchestrator, scheduler and store operations.
///
/// Per-replica failures ride inside result streams as message fields; these
/// kinds are returned for failures that happen before a stream opens, and
/// internally to pick compensation paths.
#[derive(Debug, Error)]
pub enum ArmadaError {
    #[error("no nodes match the selector")]
    NoNodes,

    #[error("not enough resource: {0}")]
    InsufficientRes(String),

    #[error("not enough cpu shares: {0}")]
    InsufficientCpu(String),

    #[error("minimum memory limit allowed is 4MB, got {0} bytes")]
    BadMemory(i64),

    #[error("replica count must be positive, got {0}")]
    BadCount(i64),

    #[error("lock {0} acquisition timed out")]
    LockTimeout(String),

    #[error("engine operation failed: {0}")]
    Engine(String),

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("pulling image {image} failed: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("pod {0} still owns nodes")]
    PodNotEmpty(String),

    #[error("node {0} still owns containers")]
    NodeNotEmpty(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ArmadaError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ArmadaError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ArmadaError::NotFound { .. })
    }
}

pub type Result<T, E = ArmadaError> = std::result::Result<T, E>;
