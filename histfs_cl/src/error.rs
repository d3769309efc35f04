use std::io;

use histfs::HistError;
use thiserror::Error;

/// Errors surfaced by a command. Printed once in `main()`, including the
/// underlying source when there is one.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad arguments or a failed check; the message says it all.
    #[error("{0}")]
    Message(String),
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: HistError,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Hist(#[from] HistError),
}

impl CliError {
    pub fn new(msg: impl Into<String>) -> Self {
        CliError::Message(msg.into())
    }
}

/// Attach a short description of what was being attempted to a failure.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T, CliError>;
}

impl<T> Context<T> for Result<T, HistError> {
    fn context(self, context: impl Into<String>) -> Result<T, CliError> {
        self.map_err(|source| CliError::Store {
            context: context.into(),
            source,
        })
    }
}

impl<T> Context<T> for Result<T, io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, CliError> {
        self.map_err(|source| CliError::Io {
            context: context.into(),
            source,
        })
    }
}

/// All command functions return this type.
pub type CliResult = Result<(), CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_source() {
        let failed: Result<(), HistError> = Err(HistError::NotFound("sub-file 'x'".to_string()));
        let e = failed.context("Error opening sub-file 'x'").unwrap_err();
        assert!(matches!(e, CliError::Store { .. }));
        assert!(e.to_string().starts_with("Error opening sub-file 'x': "));
        assert!(std::error::Error::source(&e).is_some());

        let e: CliError = HistError::Disposed("edit").into();
        assert!(matches!(e, CliError::Hist(HistError::Disposed(_))));
    }
}
