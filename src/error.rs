use std::fmt;

#[derive(Debug)]
pub enum ExportError {
    Structural(String),
    NoContent,
    Render(String),
    Asset(String),
    InvalidConfiguration(String),
    Busy,
    Io(std::io::Error),
}

impl ExportError {
    // Short stable code used in diagnostics lines.
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::Structural(_) => "STRUCTURAL",
            ExportError::NoContent => "NO_CONTENT",
            ExportError::Render(_) => "RENDER",
            ExportError::Asset(_) => "ASSET",
            ExportError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            ExportError::Busy => "BUSY",
            ExportError::Io(_) => "IO",
        }
    }
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Structural(message) => {
                write!(f, "malformed content tree: {}", message)
            }
            ExportError::NoContent => write!(f, "nothing to export: content tree is empty"),
            ExportError::Render(message) => write!(f, "page rasterization failed: {}", message),
            ExportError::Asset(message) => write!(f, "asset error: {}", message),
            ExportError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            ExportError::Busy => write!(f, "an export is already in progress"),
            ExportError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(value: std::io::Error) -> Self {
        ExportError::Io(value)
    }
}
