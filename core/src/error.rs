use std::fmt;

/// All fatal/startup-level error kinds produced by the mock engine.
///
/// Per-call failures (template render, proxy errors, mock-configured errors)
/// are not represented here: they are logged and handled inline by the
/// request pipeline, never unwound as a `MockServerError`.
#[derive(Debug)]
pub enum MockServerError {
    /// The configuration file could not be parsed or failed validation.
    ConfigLoad(String),

    /// The proto compiler toolchain failed on the supplied sources.
    ProtoCompileFailed(String),

    /// A descriptor referenced by name was not present in the compiled pool.
    DescriptorNotFound(String),

    /// A fully-qualified message/enum name has no registered type.
    UnknownType(String),

    /// An I/O error (file read, socket bind, etc.).
    Io(std::io::Error),

    /// A transport/server construction error from the gRPC stack.
    Transport(String),

    /// Any other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for MockServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockServerError::ConfigLoad(msg) => write!(f, "configuration error: {msg}"),
            MockServerError::ProtoCompileFailed(msg) => {
                write!(f, "proto compilation failed: {msg}")
            }
            MockServerError::DescriptorNotFound(name) => {
                write!(f, "descriptor not found: {name}")
            }
            MockServerError::UnknownType(name) => write!(f, "unknown type: {name}"),
            MockServerError::Io(err) => write!(f, "I/O error: {err}"),
            MockServerError::Transport(msg) => write!(f, "transport error: {msg}"),
            MockServerError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MockServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MockServerError::Io(err) => Some(err),
            MockServerError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MockServerError {
    fn from(err: std::io::Error) -> Self {
        MockServerError::Io(err)
    }
}

impl From<tonic::transport::Error> for MockServerError {
    fn from(err: tonic::transport::Error) -> Self {
        MockServerError::Transport(err.to_string())
    }
}

/// Convenience type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MockServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = MockServerError::DescriptorNotFound("book.Book".into());
        assert_eq!(err.to_string(), "descriptor not found: book.Book");

        let err = MockServerError::UnknownType("book.BookType".into());
        assert_eq!(err.to_string(), "unknown type: book.BookType");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: MockServerError = io_err.into();
        assert!(matches!(err, MockServerError::Io(_)));
    }
}
