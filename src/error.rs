use std::{fmt, io, path::PathBuf, time::Duration};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One of the five image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
    C,
    T,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::C => "C",
            Axis::T => "T",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{axis} index {value} out of bounds, must be in [0, {bound})")]
    DimensionsOutOfBounds { axis: Axis, value: i64, bound: u64 },
    #[error("pixel index {index} out of bounds for buffer of {count} pixels")]
    IndexOutOfBounds { index: usize, count: usize },
    #[error("expected {expected} bytes, got {actual}")]
    BufferSize { expected: u64, actual: u64 },
    #[error("resolution level {level} out of range, buffer has {levels} levels")]
    InvalidResolutionLevel { level: usize, levels: usize },
    #[error("pyramid for pixels {image_id} missing at {}", path.display())]
    MissingPyramid { image_id: u64, path: PathBuf },
    #[error("pyramid lock for pixels {image_id} not acquired within {waited:?}")]
    LockTimeout { image_id: u64, waited: Duration },
    #[error("{operation} failed for pixels {image_id} at {}: {source}", path.display())]
    Resource {
        image_id: u64,
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pixels {image_id} at {} opened read-only", path.display())]
    ReadOnly { image_id: u64, path: PathBuf },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Cleanup(#[from] CleanupFailure),
    #[error("{0}")]
    General(String),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn resource(
        image_id: u64,
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        Self::Resource {
            image_id,
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether a caller may retry the request after backing off.
    ///
    /// Only lock contention and a pyramid that is still being generated qualify;
    /// everything else indicates a caller bug or a broken store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::MissingPyramid { .. })
    }
}

/// Files that could not be removed by a cleanup pass.
///
/// The primary operation has already completed when this is reported.
#[derive(Debug, Default)]
pub struct CleanupFailure {
    pub failures: Vec<(PathBuf, io::Error)>,
}

impl CleanupFailure {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn push(&mut self, path: PathBuf, error: io::Error) {
        self.failures.push((path, error));
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.failures.iter().map(|(p, _)| p)
    }
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not remove {} file(s)", self.failures.len())?;
        for (path, error) in &self.failures {
            write!(f, "; {}: {error}", path.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for CleanupFailure {}
