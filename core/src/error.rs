use thiserror::Error;

/// Registry subsystem error types
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed image string
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Credential store unreadable or unparsable
    #[error("Auth resolution failed: {0}")]
    AuthResolution(String),

    /// A registry endpoint did not answer the liveness probe
    #[error("Probe failed: {domain} - {message}")]
    ProbeFailure { domain: String, message: String },

    /// Manifest media type is neither an image manifest nor a list
    #[error("Unrecognized manifest type: {0}")]
    UnrecognizedManifestType(String),

    /// No manifest list entry matched the requested platform
    #[error("No manifest matched platform: {0}")]
    PlatformNotMatched(String),

    /// Blob or manifest transfer failure
    #[error("Blob transfer failed: {image} - {message}")]
    BlobTransfer { image: String, message: String },

    /// Local storage failure
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// Storage path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Storage path escapes the driver root or is malformed
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Read offset lies beyond the end of the file
    #[error("Invalid offset: {path} @ {offset}")]
    InvalidOffset { path: String, offset: u64 },

    #[error("Writer already closed")]
    AlreadyClosed,

    #[error("Writer already committed")]
    AlreadyCommitted,

    #[error("Writer already cancelled")]
    AlreadyCancelled,

    /// Filter query could not be compiled
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Non-success response from a remote registry
    #[error("Registry error: {registry} {status} - {message}")]
    Remote {
        registry: String,
        status: u16,
        message: String,
    },

    /// Content not found on a registry endpoint
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation cancelled by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RegistryError {
    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::BlobTransfer { .. }
            | RegistryError::Timeout(_)
            | RegistryError::Io(_) => true,
            RegistryError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RegistryError {
    fn from(err: serde_yaml::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_reference_display() {
        let error = RegistryError::InvalidReference("a@b@c".to_string());
        assert_eq!(error.to_string(), "Invalid reference: a@b@c");
    }

    #[test]
    fn test_probe_failure_display() {
        let error = RegistryError::ProbeFailure {
            domain: "registry.local:5000".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Probe failed: registry.local:5000 - connection refused"
        );
    }

    #[test]
    fn test_blob_transfer_display() {
        let error = RegistryError::BlobTransfer {
            image: "docker.io/library/nginx:latest".to_string(),
            message: "unexpected EOF".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Blob transfer failed: docker.io/library/nginx:latest - unexpected EOF"
        );
    }

    #[test]
    fn test_invalid_offset_display() {
        let error = RegistryError::InvalidOffset {
            path: "/a/b".to_string(),
            offset: 42,
        };
        assert_eq!(error.to_string(), "Invalid offset: /a/b @ 42");
    }

    #[test]
    fn test_remote_error_display() {
        let error = RegistryError::Remote {
            registry: "quay.io".to_string(),
            status: 404,
            message: "manifest unknown".to_string(),
        };
        assert_eq!(error.to_string(), "Registry error: quay.io 404 - manifest unknown");
    }

    #[test]
    fn test_writer_state_errors_display() {
        assert_eq!(RegistryError::AlreadyClosed.to_string(), "Writer already closed");
        assert_eq!(
            RegistryError::AlreadyCommitted.to_string(),
            "Writer already committed"
        );
        assert_eq!(
            RegistryError::AlreadyCancelled.to_string(),
            "Writer already cancelled"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: RegistryError = io_error.into();
        assert!(matches!(error, RegistryError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let error: RegistryError = json_err.into();
        assert!(matches!(error, RegistryError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("key: [unclosed").unwrap_err();
        let error: RegistryError = yaml_err.into();
        assert!(matches!(error, RegistryError::Serialization(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RegistryError::BlobTransfer {
            image: "x".to_string(),
            message: "y".to_string()
        }
        .is_retryable());
        assert!(RegistryError::Timeout("probe".to_string()).is_retryable());
        assert!(RegistryError::Remote {
            registry: "r".to_string(),
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(RegistryError::Remote {
            registry: "r".to_string(),
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!RegistryError::Remote {
            registry: "r".to_string(),
            status: 401,
            message: String::new()
        }
        .is_retryable());
        assert!(!RegistryError::InvalidReference("x".to_string()).is_retryable());
        assert!(!RegistryError::UnrecognizedManifestType("x".to_string()).is_retryable());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<()> {
            Err(RegistryError::Other("boom".to_string()))
        }
        assert_eq!(returns_err().unwrap_err().to_string(), "boom");
    }
}
