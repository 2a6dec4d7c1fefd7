//! WolfPG Error Types

use thiserror::Error;

/// Result type alias for WolfPG operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfPG error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Rendering errors
    #[error("Invalid config value {0:?}")]
    InvalidConfigValue(String),

    #[error("{reason} line {line}: {text}")]
    MalformedConfigLine {
        line: usize,
        text: String,
        reason: String,
    },

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    // Replication errors
    #[error("Cannot clone primary: {0}")]
    ClonePrimary(String),

    // Collaborator errors
    #[error("Collaborator unreachable: {0}")]
    CollaboratorUnreachable(String),

    #[error("Command `{command}` failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    // TLS material errors
    #[error("TLS material error: {0}")]
    Tls(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("State database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the current notification should be re-delivered later
    /// instead of being reported as a failure
    pub fn should_defer(&self) -> bool {
        matches!(self, Error::CollaboratorUnreachable(_))
    }

    /// Check if this error should be surfaced to the operator as a blocked
    /// status rather than aborting the process
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Error::ClonePrimary(_)
                | Error::MalformedConfigLine { .. }
                | Error::InvalidConfigValue(_)
                | Error::Tls(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_line_message_carries_location() {
        let err = Error::MalformedConfigLine {
            line: 3,
            text: "max_connections = 'oops".into(),
            reason: "Badly quoted value".into(),
        };
        assert_eq!(
            err.to_string(),
            "Badly quoted value line 3: max_connections = 'oops"
        );
        assert!(err.is_blocking());
        assert!(!err.should_defer());
    }

    #[test]
    fn test_unreachable_is_deferred() {
        let err = Error::CollaboratorUnreachable("supervisor".into());
        assert!(err.should_defer());
        assert!(!err.is_blocking());
    }
}
