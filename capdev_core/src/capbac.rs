//! Invocation of the external `capbac` tool.
//!
//! The tool is always run as an awaited child process so a slow ledger
//! lookup never stalls the runtime thread handling other requests.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

pub type Result<T> = std::result::Result<T, CapbacError>;

pub const DEFAULT_PROGRAM: &str = "capbac";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CapbacError {
    #[error("capbac command is empty")]
    EmptyCommand,

    #[error("Failed to run capbac: {0}")]
    Io(#[from] std::io::Error),

    #[error("capbac exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("capbac output is not valid UTF-8")]
    NonUtf8Output,

    #[error("capbac timed out after {0:?}")]
    Timeout(Duration),
}

/// Handle on the `capbac` command line tool.
///
/// `command` is the program followed by any leading arguments, so wrappers
/// such as `["docker", "exec", "ledger", "capbac"]` work unchanged.
#[derive(Debug, Clone)]
pub struct CapbacCli {
    command: Vec<String>,
    timeout: Duration,
}

impl CapbacCli {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// `capbac validate <envelope>`
    pub async fn validate(&self, envelope: &str) -> Result<String> {
        self.run(&["validate", envelope]).await
    }

    /// `capbac issue --root <token>`
    pub async fn issue_root(&self, token: &str) -> Result<String> {
        self.run(&["issue", "--root", token]).await
    }

    /// Run the tool and return its standard output
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let (program, leading) = self.command.split_first().ok_or(CapbacError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(leading)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("Running {} {:?}", program, args.first());

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| CapbacError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(CapbacError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout).map_err(|_| CapbacError::NonUtf8Output)
    }
}

impl Default for CapbacCli {
    fn default() -> Self {
        Self::new(vec![DEFAULT_PROGRAM.to_string()])
    }
}
