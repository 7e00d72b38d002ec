//! Errors reported while processing a single test file.
//!
//! Failed commands are not errors; they are part of a successful
//! [`ExecutedTest`](crate::runner::ExecutedTest).

use crate::parser::InvalidTestError;
use crate::script::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The test file is malformed.
    #[error(transparent)]
    InvalidTest(#[from] InvalidTestError),

    /// Reading the test file, preparing its working directory or running
    /// the shell failed.
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The shell output could not be matched up with the commands.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
