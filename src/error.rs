//! Error types for map loading and rendering.
//!
//! Parse and mesh failures are recoverable by the caller (the host reports
//! them and exits before any window exists). Render failures come from the
//! graphics backend and are fatal for the session.

use std::fmt;
use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// What went wrong while parsing a heightmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// A numeral was expected but not found.
    InvalidDigit,
    /// A color was not `0x` followed by at least one hex digit.
    InvalidHex,
    /// A line terminator other than `\n` (typically `\r`).
    InvalidNewline,
    /// A row has a different vertex count than the first row.
    IncompleteTetragon { expected: usize, found: usize },
    /// The elevation does not fit in a 32-bit signed integer.
    ElevationOutOfRange,
    /// The first row holds no vertices.
    EmptyGrid,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDigit => write!(f, "invalid digit found"),
            Self::InvalidHex => write!(f, "invalid hex"),
            Self::InvalidNewline => write!(f, "invalid newline"),
            Self::IncompleteTetragon { expected, found } => write!(
                f,
                "not complete tetragon (expected {expected} vertices, found {found})"
            ),
            Self::ElevationOutOfRange => write!(f, "elevation out of range"),
            Self::EmptyGrid => write!(f, "empty grid"),
        }
    }
}

/// A heightmap syntax error. `line` and `column` are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: error: {kind}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
    pub column: usize,
}

/// Grid shapes that cannot be turned into a strip mesh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("a strip needs at least 2 columns, the grid has {columns}")]
    TooFewColumns { columns: usize },
}

/// Failure while turning a map file into a mesh.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

/// Error type for physical device suitability checks.
#[derive(Debug, Error)]
pub enum SuitabilityError {
    #[error("Static error: {0}")]
    Static(&'static str),
    #[error("Dynamic error: {0}")]
    Dynamic(String),
}

/// Graphics backend and frame loop failures.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("no suitable physical device found")]
    NoSuitableDevice,
    #[error("device rejected: {0}")]
    Unsuitable(#[from] SuitabilityError),
    #[error("no suitable memory type found")]
    NoSuitableMemoryType,
    #[error("failed to load shader {}: {source}", path.display())]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("window error: {0}")]
    Window(String),
    #[error("swapchain is out of date")]
    SwapchainOutOfDate,
    #[error("no mesh imported before drawing")]
    MeshNotImported,
    #[error("a mesh was already imported")]
    MeshAlreadyImported,
    #[error("acquired image index {index} but only {slots} frame slots exist")]
    ImageIndexOutOfRange { index: u32, slots: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display_carries_position() {
        let err = ParseError {
            kind: ParseErrorKind::InvalidHex,
            line: 3,
            column: 7,
        };
        assert_eq!(err.to_string(), "3:7: error: invalid hex");
    }

    #[test]
    fn tetragon_message_names_counts() {
        let kind = ParseErrorKind::IncompleteTetragon {
            expected: 4,
            found: 3,
        };
        assert_eq!(
            kind.to_string(),
            "not complete tetragon (expected 4 vertices, found 3)"
        );
    }

    #[test]
    fn load_error_is_transparent_over_parse() {
        let err = LoadError::from(ParseError {
            kind: ParseErrorKind::InvalidDigit,
            line: 1,
            column: 1,
        });
        assert_eq!(err.to_string(), "1:1: error: invalid digit found");
    }
}
