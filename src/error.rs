//! Error taxonomy for layout validation, external tools and teardown.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while planning or running a build.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid user-supplied layout or option. Raised before any host
    /// resource is acquired and never retried.
    #[error("{0}")]
    Configuration(String),

    /// The size or type of a host path could not be determined.
    #[error("no idea how to find the size of {}", .0.display())]
    UnsupportedResource(PathBuf),

    /// A lookup (partition owner, registry entry, setting) came up empty.
    #[error("{0}")]
    NotFound(String),

    /// The program could not be located on the host.
    #[error("couldn't find the program '{0}' on your system")]
    ToolNotFound(String),

    /// The program exists but could not be started.
    #[error("couldn't launch the program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A shelled-out command exited non-zero.
    #[error("{message}: `{command}` returned {status}\nstdout: {stdout}\nstderr: {stderr}")]
    ExternalTool {
        message: String,
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// Loop device teardown kept failing after the bounded retries.
    #[error("could not unmap {} after {attempts} attempts: {source}", .path.display())]
    Teardown {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// One or more cleanup actions failed while the stack was drained.
    #[error("{} cleanup action(s) failed: {}", .0.len(), summarize(.0))]
    Cleanup(Vec<Error>),

    /// A setting was given a value of the wrong type or outside its options.
    #[error("{0}")]
    Setting(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn setting(msg: impl Into<String>) -> Self {
        Error::Setting(msg.into())
    }

    /// True for errors caused by user input rather than the host.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::Setting(_) | Error::ToolNotFound(_)
        )
    }
}

fn summarize(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
