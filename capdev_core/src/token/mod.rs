//! Capability token data model.
//!
//! These types mirror the JSON shapes understood by the `capbac` tool. Field
//! names on the wire are the short upper-case keys (`ID`, `DE`, `AR`, ...).

mod action;
mod timestamp;

pub use action::{Action, ParseActionError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One permitted (action, resource) pair within a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    #[serde(rename = "AC")]
    pub action: Action,

    #[serde(rename = "RE")]
    pub resource: String,

    /// Maximum delegation delay, in seconds
    #[serde(rename = "DD")]
    pub max_delay_secs: u64,
}

impl AccessRule {
    pub fn new(action: Action, resource: impl Into<String>, max_delay_secs: u64) -> Self {
        Self {
            action,
            resource: resource.into(),
            max_delay_secs,
        }
    }
}

/// A signed grant scoped to one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    #[serde(rename = "ID")]
    pub id: String,

    /// Reference to the issuing token, absent for root tokens
    #[serde(rename = "IC", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    #[serde(rename = "DE")]
    pub device: String,

    #[serde(rename = "AR")]
    pub rules: Vec<AccessRule>,

    /// Unix seconds, encoded as a decimal string
    #[serde(rename = "NB", with = "timestamp")]
    pub not_before: i64,

    /// Unix seconds, encoded as a decimal string
    #[serde(rename = "NA", with = "timestamp")]
    pub not_after: i64,
}

impl CapabilityToken {
    /// Create a root token that becomes valid now
    pub fn root(
        id: impl Into<String>,
        device: impl Into<String>,
        rules: Vec<AccessRule>,
        not_after: i64,
    ) -> Self {
        Self {
            id: id.into(),
            issuer: None,
            device: device.into(),
            rules,
            not_before: Utc::now().timestamp(),
            not_after,
        }
    }

    pub fn is_root(&self) -> bool {
        self.issuer.is_none()
    }

    /// Whether any rule grants `action` on `resource`
    pub fn permits(&self, action: Action, resource: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.action == action && rule.resource == resource)
    }

    /// Whether `now` (Unix seconds) falls within the validity window
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// The envelope embedded at the start of a request body.
///
/// Only the requested action is mandatory. Everything else the client put in
/// the envelope is kept so the validator sees it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    #[serde(rename = "AC")]
    pub action: Action,

    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,

    #[serde(rename = "DE", default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(rename = "RE", default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ValidationRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            token_id: None,
            device: None,
            resource: None,
            extra: Map::new(),
        }
    }
}

/// A parsed envelope together with the exact text it was parsed from
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub raw: String,
    pub request: ValidationRequest,
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let request = serde_json::from_str(raw)?;
        Ok(Self {
            raw: raw.to_string(),
            request,
        })
    }

    pub fn action(&self) -> Action {
        self.request.action
    }
}

/// Answer returned by the token validator.
///
/// A missing `authorized` member reads as `false`; a non-boolean one is a
/// parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default)]
    pub authorized: bool,
}

impl ValidationResult {
    pub fn from_output(output: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(output.trim())
    }
}

/// Scope of a revocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RevocationType {
    /// The token and everything derived from it
    All,
    /// Only the token itself
    Only,
    /// Only tokens derived from it
    Children,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRequest {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "IC")]
    pub issuer: String,

    #[serde(rename = "DE")]
    pub device: String,

    #[serde(rename = "RT")]
    pub revocation_type: RevocationType,
}
