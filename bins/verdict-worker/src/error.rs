use std::path::PathBuf;

/// Error taxonomy for submission processing.
///
/// Compile and test failures are not errors; they travel through the
/// result data model. Everything here either aborts the submission
/// (reported as `internal_error`) or aborts the worker.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A pluggable strategy failed. Caught at the worker's top level,
    /// converted into an `internal_error` result and a postmortem dump.
    #[error("plugin {namespace}/{name} failed: {source}")]
    Plugin {
        namespace: &'static str,
        name: String,
        #[source]
        source: Box<JudgeError>,
    },

    /// A readiness marker never appeared within its fixed budget. This is
    /// a wrapper-script contract violation, not a test failure.
    #[error("handshake marker {} did not appear within {timeout_ms} ms", marker.display())]
    HandshakeTimeout { marker: PathBuf, timeout_ms: u64 },

    #[error("instance lock was stolen by another worker instance; \
             two workers appear to share the same instance name")]
    LockStolen,

    #[error("service sandbox failed: {0}")]
    Service(String),

    #[error("package error: {0}")]
    Package(String),

    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("queue error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data: {0}")]
    Json(#[from] serde_json::Error),
}

impl JudgeError {
    pub fn plugin(namespace: &'static str, name: &str, source: JudgeError) -> Self {
        JudgeError::Plugin {
            namespace,
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;
