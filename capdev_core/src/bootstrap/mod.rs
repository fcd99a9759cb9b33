//! Root token bootstrap.
//!
//! Before the device serves anything it registers its root capability token
//! with the ledger through `capbac issue --root` and waits until the ledger
//! reports the transaction as committed. Any failure aborts startup.

use crate::capbac::{CapbacCli, CapbacError};
use crate::config::ServerConfig;
use crate::token::CapabilityToken;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type Result<T> = std::result::Result<T, BootstrapError>;

/// Ledger status of a committed transaction
pub const COMMITTED: &str = "COMMITTED";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Failed to serialize root token: {0}")]
    Serialize(serde_json::Error),

    #[error("capbac issue failed: {0}")]
    Issue(#[from] CapbacError),

    #[error("Unexpected capbac issue output: {0}")]
    MalformedReceipt(serde_json::Error),

    #[error("Ledger request failed: {0}")]
    Ledger(#[from] reqwest::Error),

    #[error("Ledger response has no status entry")]
    EmptyLedgerResponse,

    #[error("Token status: {0}.")]
    NotCommitted(String),
}

/// Bootstrap phase, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Issue,
    Settle,
    Confirm,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapPhase::Issue => write!(f, "issue"),
            BootstrapPhase::Settle => write!(f, "settle"),
            BootstrapPhase::Confirm => write!(f, "confirm"),
        }
    }
}

/// `capbac issue` output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssueReceipt {
    pub link: String,
}

/// Body returned by the ledger link
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerResponse {
    #[serde(default)]
    pub data: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntry {
    pub status: String,
}

impl LedgerResponse {
    pub fn status(&self) -> Option<&str> {
        self.data.first().map(|entry| entry.status.as_str())
    }
}

/// The root token described by the configuration, valid from now
pub fn root_token(config: &ServerConfig) -> CapabilityToken {
    CapabilityToken::root(
        config.bootstrap.token_id.clone(),
        config.bootstrap.device.clone(),
        config.root_rules(),
        config.bootstrap.not_after,
    )
}

pub struct Bootstrapper {
    capbac: CapbacCli,
    http: reqwest::Client,
    settle_delay: Duration,
    max_attempts: u32,
}

impl Bootstrapper {
    pub fn new(capbac: CapbacCli) -> Self {
        Self {
            capbac,
            http: reqwest::Client::new(),
            settle_delay: Duration::from_secs(5),
            max_attempts: 1,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.capbac.cli())
            .with_settle_delay(Duration::from_secs(config.bootstrap.settle_delay_secs))
            .with_max_attempts(config.bootstrap.max_attempts)
    }

    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Issue `token` and wait for the ledger to commit it
    pub async fn run(&self, token: &CapabilityToken) -> Result<IssueReceipt> {
        info!(phase = %BootstrapPhase::Issue, "Issuing root token {}", token.id);
        let receipt = self.issue(token).await?;
        debug!("Ledger link: {}", receipt.link);

        let mut attempt = 1;
        loop {
            debug!(phase = %BootstrapPhase::Settle, "Waiting {:?}", self.settle_delay);
            tokio::time::sleep(self.settle_delay).await;

            info!(phase = %BootstrapPhase::Confirm, attempt, "Checking result");
            match self.status(&receipt.link).await {
                Ok(status) if status == COMMITTED => {
                    info!("Root token committed");
                    return Ok(receipt);
                }
                Ok(status) if attempt >= self.max_attempts => {
                    return Err(BootstrapError::NotCommitted(status))
                }
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Ok(status) => warn!("Token status {}, retrying", status),
                Err(e) => warn!("Ledger check failed, retrying: {}", e),
            }
            attempt += 1;
        }
    }

    pub async fn issue(&self, token: &CapabilityToken) -> Result<IssueReceipt> {
        let json = serde_json::to_string(token).map_err(BootstrapError::Serialize)?;
        let output = self.capbac.issue_root(&json).await?;
        serde_json::from_str(output.trim()).map_err(BootstrapError::MalformedReceipt)
    }

    /// Status of the first ledger entry behind `link`
    pub async fn status(&self, link: &str) -> Result<String> {
        let response: LedgerResponse = self
            .http
            .get(link)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .status()
            .map(str::to_string)
            .ok_or(BootstrapError::EmptyLedgerResponse)
    }
}
