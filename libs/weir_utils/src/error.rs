// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{borrow::Cow, fmt, sync::Arc};

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine can surface.
///
/// The first three variants are validation errors: they are returned synchronously from the
/// offending call and never change the state of a stream. All other variants are stream errors,
/// reasons supplied by producer/consumer code that latch a stream into its errored state.
#[derive(Clone, thiserror::Error)]
pub enum Error {
    #[error("TypeError: {0}")]
    InvalidArgument(Cow<'static, str>),
    #[error("TypeError: {0}")]
    InvalidState(Cow<'static, str>),
    #[error("RangeError: {0}")]
    OutOfRange(Cow<'static, str>),
    #[error("AbortError: {0}")]
    Aborted(Cow<'static, str>),
    #[error("TimeoutError: {0}")]
    Timeout(Cow<'static, str>),
    #[error("{0}")]
    Message(Arc<str>),
    #[error("[{}]", CompositeDisplay(.0))]
    Composite(Arc<[Error]>),
    #[error("undefined")]
    Unspecified,
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn out_of_range(message: impl Into<Cow<'static, str>>) -> Self {
        Self::OutOfRange(message.into())
    }

    pub fn message(message: impl AsRef<str>) -> Self {
        Self::Message(Arc::from(message.as_ref()))
    }

    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }

    pub fn composite(reasons: impl IntoIterator<Item = Error>) -> Self {
        Self::Composite(reasons.into_iter().collect())
    }

    /// True for the fixed validation taxonomy (invalid argument, invalid state, out of range).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvalidState(_) | Self::OutOfRange(_)
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(e) => f.debug_tuple("Other").field(e).finish(),
            Self::Composite(reasons) => f.debug_tuple("Composite").field(reasons).finish(),
            other => write!(f, "{other}"),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidArgument(a), Self::InvalidArgument(b))
            | (Self::InvalidState(a), Self::InvalidState(b))
            | (Self::OutOfRange(a), Self::OutOfRange(b))
            | (Self::Aborted(a), Self::Aborted(b))
            | (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Message(a), Self::Message(b)) => a == b,
            (Self::Composite(a), Self::Composite(b)) => a == b,
            (Self::Unspecified, Self::Unspecified) => true,
            (Self::Other(a), Self::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Self::message(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Message(Arc::from(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::other(value)
    }
}

struct CompositeDisplay<'a>(&'a [Error]);

impl fmt::Display for CompositeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reason) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{reason}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_classified() {
        assert!(Error::invalid_argument("x").is_validation());
        assert!(Error::invalid_state("x").is_validation());
        assert!(Error::out_of_range("x").is_validation());
        assert!(!Error::message("x").is_validation());
        assert!(!Error::Unspecified.is_validation());
    }

    #[test]
    fn composite_display_lists_reasons_in_order() {
        let e = Error::composite([Error::message("first"), Error::Unspecified]);
        assert_eq!(e.to_string(), "[first, undefined]");
        assert_eq!(
            e,
            Error::composite([Error::message("first"), Error::Unspecified])
        );
    }

    #[test]
    fn other_errors_compare_by_identity() {
        let e = Error::other(std::io::Error::other("boom"));
        assert_eq!(e, e.clone());
        assert_ne!(e, Error::other(std::io::Error::other("boom")));
        assert_eq!(e.to_string(), "boom");
    }
}
