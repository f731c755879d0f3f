// src/error.rs
//! Error handling for the whole crate.
//!
//! - **Taxonomy**: configuration errors are rejected at setup, resource errors are
//!   absorbed by the occlusion path (it fails open), invariant violations are bugs
//!   and only surface through explicit validation.
//! - **Features**: Context chaining, custom messages, transparent std errors, `is_*` helpers, `Result` alias.

use thiserror::Error;

/// Main error type. Send + Sync + 'static.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O errors (stats output, config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration parsing.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rejected configuration (inverted thresholds, NaN, bad workgroup size...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A GPU or CPU resource was not ready (zero-sized depth buffer, missing pyramid).
    #[error("resource not ready: {0}")]
    Resource(String),

    /// Compaction produced ranges that do not partition the input.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Device, mapping or submission failure on the wgpu path.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    #[inline]
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::Invariant(msg.into())
    }

    /// Add context to any error (chainable, like `.context()` in anyhow).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context layers and return the innermost error.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self.root(), Error::Config(_))
    }

    #[inline]
    pub fn is_resource(&self) -> bool {
        matches!(self.root(), Error::Resource(_))
    }

    #[inline]
    pub fn is_invariant(&self) -> bool {
        matches!(self.root(), Error::Invariant(_))
    }
}

/// Convenient `Result` alias, use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;

/// `.context()` on results, mirroring what anyhow offers.
pub trait Context<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for std::result::Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| Into::<Error>::into(e).context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = Error::config("instance limit is NaN").context("loading scene");
        assert!(err.is_config());
        assert!(!err.is_invariant());
        assert_eq!(
            err.to_string(),
            "loading scene: invalid configuration: instance limit is NaN"
        );
    }

    #[test]
    fn result_context_wraps_foreign_errors() {
        let parsed: std::result::Result<u32, serde_json::Error> = serde_json::from_str("nope");
        let err = parsed.context("reading splitter config").unwrap_err();
        assert!(matches!(err.root(), Error::Json(_)));
    }
}
