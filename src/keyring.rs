//! Access to auth tokens held in the platform keyring.
//!
//! The cache never stores raw auth tokens; it remembers which keyring entry
//! holds one and validates against the live entry on use. The lookup is a
//! trait so tests and embedders can supply their own keyring.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// An auth token as read from a keyring entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringToken {
    /// Public id of the auth token, e.g. `at_1234567890`.
    pub id: String,
    /// Public id of the user the token authenticates.
    pub user_id: String,
    /// The bearer token itself.
    pub token: String,
}

/// Resolves `(keyring kind, token name)` pairs to live auth tokens.
pub trait KeyringTokenLookup: Send + Sync {
    fn lookup(&self, keyring_kind: &str, token_name: &str) -> Option<KeyringToken>;
}

impl<F> KeyringTokenLookup for F
where
    F: Fn(&str, &str) -> Option<KeyringToken> + Send + Sync,
{
    fn lookup(&self, keyring_kind: &str, token_name: &str) -> Option<KeyringToken> {
        self(keyring_kind, token_name)
    }
}

/// A keyring backed by a JSON file mapping `kind/name` to tokens. Stands in
/// on platforms without a native keyring service.
pub struct FileKeyring {
    entries: HashMap<String, KeyringToken>,
}

impl FileKeyring {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        const OP: &str = "keyring.file_load";
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::not_found(OP, format!("{}: {e}", path.as_ref().display())))?;
        let entries: HashMap<String, KeyringToken> =
            serde_json::from_str(&raw).map_err(|e| Error::encoding(OP, e))?;
        Ok(FileKeyring { entries })
    }
}

impl KeyringTokenLookup for FileKeyring {
    fn lookup(&self, keyring_kind: &str, token_name: &str) -> Option<KeyringToken> {
        self.entries.get(&format!("{keyring_kind}/{token_name}")).cloned()
    }
}
