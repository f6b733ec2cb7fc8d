//! Periodic refresh of the per-user target cache.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::cache::repository::{Repository, StoredToken, User};
use crate::errors::{Error, Result};
use crate::resource::ResourceKind;
use crate::store::targets::Target;

/// Fetches the targets visible to an auth token from the remote service.
/// The default implementation lives in [`crate::api::Client`]; tests inject
/// their own.
#[async_trait]
pub trait TargetRetrieval: Send + Sync {
    async fn list_targets(&self, boundary_addr: &str, auth_token: &str) -> Result<Vec<Target>>;
}

impl Repository {
    /// Refresh the cached targets of every known user.
    ///
    /// Stale stored tokens are dropped first. For each user the stored
    /// tokens are tried most recently used first until one produces a
    /// listing, which then atomically replaces the user's cached targets.
    /// Tokens that vanished from the keyring are deleted along the way.
    /// Per-user failures are recorded and accumulated; one user's failure
    /// does not stop the others.
    pub async fn refresh(&self, retrieval: &dyn TargetRetrieval) -> Result<()> {
        const OP: &str = "cache.refresh";
        self.remove_stale_stored_tokens().await?;

        let stored = self.list_stored_tokens().await?;
        let mut by_user: HashMap<User, Vec<StoredToken>> = HashMap::new();
        for token in stored {
            let user = User {
                boundary_addr: token.boundary_addr.clone(),
                user_id: token.user_id.clone(),
            };
            by_user.entry(user).or_default().push(token);
        }

        let mut errs = Vec::new();
        for (user, mut tokens) in by_user {
            tokens.sort_by(|a, b| b.last_accessed_time.cmp(&a.last_accessed_time));

            let mut retrieved: Option<Vec<Target>> = None;
            for token in &tokens {
                let at = match self.keyring().lookup(&token.keyring_type, &token.token_name) {
                    Some(at) => at,
                    None => {
                        // The keyring entry is gone, so the stored token is
                        // unusable from here on.
                        if let Err(e) = self.delete_stored_token(token).await {
                            errs.push(e);
                        }
                        continue;
                    }
                };
                match retrieval.list_targets(&user.boundary_addr, &at.token).await {
                    Ok(targets) => {
                        retrieved = Some(targets);
                        break;
                    }
                    Err(e) => {
                        if let Err(save_err) =
                            self.save_api_error(&token.token_name, ResourceKind::Target, &e).await
                        {
                            errs.push(save_err);
                        }
                        errs.push(Error::transport(
                            OP,
                            format!(
                                "listing targets for user {} with stored token {}/{}: {e}",
                                user.user_id, token.keyring_type, token.token_name
                            ),
                        ));
                    }
                }
            }

            let Some(targets) = retrieved else {
                // No token worked; leave the user's cached targets alone.
                continue;
            };
            tracing::info!(
                user_id = %user.user_id,
                boundary_addr = %user.boundary_addr,
                count = targets.len(),
                "updating cached targets",
            );
            if let Err(e) = self.replace_cached_targets(&user, &targets).await {
                errs.push(e);
            }
        }
        Error::join(errs)
    }
}
