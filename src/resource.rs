//! Resource kinds and the accessor trait the list machinery is generic over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// The kinds of resources served by list endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Target,
    Scope,
    Credential,
    CredentialLibrary,
    Account,
    SessionRecording,
}

impl ResourceKind {
    /// The public-id prefix for this kind, e.g. `t` in `t_x1y2z3`.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Target => "t",
            ResourceKind::Scope => "s",
            ResourceKind::Credential => "c",
            ResourceKind::CredentialLibrary => "cl",
            ResourceKind::Account => "a",
            ResourceKind::SessionRecording => "sr",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Target => "target",
            ResourceKind::Scope => "scope",
            ResourceKind::Credential => "credential",
            ResourceKind::CredentialLibrary => "credential-library",
            ResourceKind::Account => "account",
            ResourceKind::SessionRecording => "session-recording",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh public id for the given kind.
pub fn new_public_id(kind: ResourceKind) -> String {
    format!("{}_{}", kind.id_prefix(), Uuid::new_v4().simple())
}

/// Check that a public id carries the prefix of its declared kind.
pub fn validate_public_id(op: &'static str, kind: ResourceKind, public_id: &str) -> Result<()> {
    if public_id.is_empty() {
        return Err(Error::invalid_public_id(op, "missing public id"));
    }
    let expected = format!("{}_", kind.id_prefix());
    if !public_id.starts_with(&expected) {
        return Err(Error::invalid_public_id(
            op,
            format!("public id {public_id:?} does not have the {expected:?} prefix for kind {kind}"),
        ));
    }
    Ok(())
}

/// Accessors the pagination machinery needs from any listable resource.
/// These are the only fields that participate in ordering; `create_time`
/// never exceeds `update_time` and `update_time` only advances.
pub trait Resource {
    fn public_id(&self) -> &str;
    fn create_time(&self) -> DateTime<Utc>;
    fn update_time(&self) -> DateTime<Utc>;
    fn resource_kind(&self) -> ResourceKind;
}
