use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` is the error type for the block stores, the index and the cache facade.
///
/// Only [`Error::Corruption`] is recovered from internally (by discarding and rebuilding the
/// cache file). Every other variant is propagated to the caller.
#[derive(Clone, Debug)]
pub enum Error {
	Io(Arc<io::Error>),         // An I/O error occurred
	Corruption(String),         // The on-disk structure does not match what was expected
	IntegrityViolation(String), // verify() found a structural problem
	IllegalState(String),       // The store is not open
	UnbalancedTree(String),     // An underflowing node has no sibling to rebalance with
	InvalidArgument(String),
	Serialization(String),
	Operation {
		message: String,
		source: Box<Error>,
	},
}

impl Error {
	pub(crate) fn corruption(msg: impl Into<String>) -> Self {
		Error::Corruption(msg.into())
	}

	/// Returns true if this error, or the error it wraps, signals a corrupted store.
	pub fn is_corruption(&self) -> bool {
		match self {
			Error::Corruption(_) => true,
			Error::Operation {
				source,
				..
			} => source.is_corruption(),
			_ => false,
		}
	}

	/// Returns the innermost error, skipping any context added on the way up.
	pub fn root_cause(&self) -> &Error {
		match self {
			Error::Operation {
				source,
				..
			} => source.root_cause(),
			other => other,
		}
	}

	pub(crate) fn context(self, message: impl Into<String>) -> Self {
		Error::Operation {
			message: message.into(),
			source: Box::new(self),
		}
	}
}

// Implementation of Display trait for Error
impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::Corruption(err) => write!(f, "Corrupted store: {err}"),
			Error::IntegrityViolation(err) => write!(f, "Integrity violation: {err}"),
			Error::IllegalState(err) => write!(f, "Illegal state: {err}"),
			Error::UnbalancedTree(err) => write!(f, "Cannot rebalance tree: {err}"),
			Error::InvalidArgument(err) => write!(f, "Invalid argument: {err}"),
			Error::Serialization(err) => write!(f, "Serialization error: {err}"),
			Error::Operation {
				message,
				source,
			} => write!(f, "{message}: {source}"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(err) => Some(err.as_ref()),
			Error::Operation {
				source,
				..
			} => Some(source.as_ref()),
			_ => None,
		}
	}
}

// Implementation to convert io::Error into Error
impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(Arc::new(e))
	}
}

impl From<bincode::Error> for Error {
	fn from(e: bincode::Error) -> Error {
		Error::Serialization(e.to_string())
	}
}
