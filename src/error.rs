use std::path::PathBuf;

// Errors surfaced by the limiter, the admitter and startup validation
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Invalid IP address {0}")]
    InvalidAddress(String),

    #[error("Error adding IP address {address} to set {set}: {reason}")]
    AdmissionExec {
        set: String,
        address: String,
        reason: String,
    },

    #[error("Blacklist file {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GateError {
    pub fn persistence(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        GateError::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }
}
