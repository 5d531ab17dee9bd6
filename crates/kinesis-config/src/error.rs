//! Errors raised while persisting `physics.ron` and `materials.ron`.

use std::path::PathBuf;

/// A failed load or save of one of the RON files in the config directory.
/// Every variant names the file it was working on.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `physics.ron` or `materials.ron` exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config directory or the file inside it could not be written.
    #[error("cannot write {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid `Config` (or material list); the span
    /// points at the offending token.
    #[error("invalid RON in {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    /// Settings or materials did not serialize.
    #[error("cannot serialize {}: {source}", path.display())]
    SerializeError {
        path: PathBuf,
        #[source]
        source: ron::Error,
    },
}

impl ConfigError {
    pub(crate) fn read(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::ReadError { path, source }
    }

    pub(crate) fn write(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::WriteError { path, source }
    }

    pub(crate) fn parse(
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(ron::error::SpannedError) -> Self {
        let path = path.into();
        move |source| Self::ParseError { path, source }
    }

    pub(crate) fn serialize(path: impl Into<PathBuf>) -> impl FnOnce(ron::Error) -> Self {
        let path = path.into();
        move |source| Self::SerializeError { path, source }
    }

    /// The file the failure concerns.
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::ReadError { path, .. }
            | Self::WriteError { path, .. }
            | Self::ParseError { path, .. }
            | Self::SerializeError { path, .. } => path,
        }
    }
}
