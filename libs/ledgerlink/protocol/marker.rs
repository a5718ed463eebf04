use crate::error::{LinkError, Result};

/// Which marker shape a protocol resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Integer stream position (inclusive restart point)
    Position,
    /// Opaque server-issued cursor string
    Cursor,
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerKind::Position => write!(f, "position"),
            MarkerKind::Cursor => write!(f, "cursor"),
        }
    }
}

/// Resumption marker for one stream.
///
/// A tagged union keyed by protocol: position-based protocols resume from an
/// integer position, cursor-based ones from an opaque string. Markers are
/// validated where they are set, never at restart time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeMarker {
    /// Restart from this stream position, inclusive
    Position(u64),
    /// Restart from this opaque cursor
    Cursor(String),
}

impl ResumeMarker {
    pub fn kind(&self) -> MarkerKind {
        match self {
            ResumeMarker::Position(_) => MarkerKind::Position,
            ResumeMarker::Cursor(_) => MarkerKind::Cursor,
        }
    }

    /// Shape validation: positions must be positive, cursors non-empty.
    pub fn validate(&self) -> Result<()> {
        match self {
            ResumeMarker::Position(0) => Err(LinkError::InvalidMarker(
                "position must be greater than zero".into(),
            )),
            ResumeMarker::Cursor(c) if c.is_empty() => {
                Err(LinkError::InvalidMarker("cursor must not be empty".into()))
            }
            _ => Ok(()),
        }
    }

    /// Shape validation plus protocol compatibility.
    pub fn validate_for(&self, expected: MarkerKind) -> Result<()> {
        self.validate()?;
        if self.kind() != expected {
            return Err(LinkError::InvalidMarker(format!(
                "protocol resumes from a {} marker, got a {} marker",
                expected,
                self.kind()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for ResumeMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResumeMarker::Position(p) => write!(f, "position {}", p),
            ResumeMarker::Cursor(c) => write!(f, "cursor '{}'", c),
        }
    }
}
