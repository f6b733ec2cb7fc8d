use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;

use crate::cache::query::compile_query;
use crate::cache::{STORED_TOKEN_LIMIT, STORED_TOKEN_STALENESS_HOURS};
use crate::errors::{Error, Result};
use crate::keyring::KeyringTokenLookup;
use crate::resource::ResourceKind;
use crate::store::targets::Target;
use crate::store::{from_millis, retry, to_millis, Store};

/// A user known to the cache, identified by the address of the service that
/// authenticated them plus their user id there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    pub boundary_addr: String,
    pub user_id: String,
}

/// A reference to an auth token held in the platform keyring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub keyring_type: String,
    pub token_name: String,
    pub boundary_addr: String,
    pub auth_token_id: String,
    pub user_id: String,
    pub last_accessed_time: DateTime<Utc>,
}

#[derive(FromRow)]
struct StoredTokenRow {
    keyring_type: String,
    token_name: String,
    boundary_addr: String,
    auth_token_id: String,
    user_id: String,
    last_accessed_time: i64,
}

impl StoredTokenRow {
    fn into_token(self, op: &'static str) -> Result<StoredToken> {
        Ok(StoredToken {
            keyring_type: self.keyring_type,
            token_name: self.token_name,
            boundary_addr: self.boundary_addr,
            auth_token_id: self.auth_token_id,
            user_id: self.user_id,
            last_accessed_time: from_millis(op, self.last_accessed_time)?,
        })
    }
}

/// Options for [`Repository::lookup_stored_auth_token_id`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions {
    /// Advance the row's last accessed time on a hit.
    pub update_last_accessed_time: bool,
}

/// Cache repository: stored tokens, users, cached targets and recorded api
/// errors, all over the embedded store.
#[derive(Clone)]
pub struct Repository {
    store: Store,
    keyring: Arc<dyn KeyringTokenLookup>,
}

impl Repository {
    pub fn new(store: Store, keyring: Arc<dyn KeyringTokenLookup>) -> Self {
        Repository { store, keyring }
    }

    pub(crate) fn keyring(&self) -> &dyn KeyringTokenLookup {
        self.keyring.as_ref()
    }

    /// Add a stored token, validating it against the live keyring entry.
    /// Re-adding an existing token refreshes its last accessed time. If the
    /// stored token count then exceeds the limit, the least recently used
    /// row is evicted in the same transaction.
    pub async fn add_stored_token(
        &self,
        boundary_addr: &str,
        token_name: &str,
        keyring_type: &str,
        auth_token_id: &str,
    ) -> Result<()> {
        const OP: &str = "cache.add_stored_token";
        if boundary_addr.is_empty() {
            return Err(Error::invalid_parameter(OP, "boundary address is empty"));
        }
        if token_name.is_empty() {
            return Err(Error::invalid_parameter(OP, "token name is empty"));
        }
        if keyring_type.is_empty() {
            return Err(Error::invalid_parameter(OP, "keyring type is empty"));
        }

        let at = self
            .keyring
            .lookup(keyring_type, token_name)
            .ok_or_else(|| Error::invalid_parameter(OP, "unable to find token in the keyring specified"))?;
        if at.id != auth_token_id {
            return Err(Error::invalid_parameter(OP, "provided auth token id doesn't match the one stored"));
        }

        retry(OP, || async {
            let now = to_millis(Utc::now());
            let mut tx = self.store.pool().begin().await.map_err(|e| Error::from_sqlx(OP, e))?;

            // A stored token must reference a user row, so ensure one exists
            // before writing the token.
            sqlx::query(
                "insert into cache_user (boundary_addr, user_id, last_accessed_time) values (?, ?, ?) \
                 on conflict (boundary_addr, user_id) do update set last_accessed_time = excluded.last_accessed_time",
            )
            .bind(boundary_addr)
            .bind(&at.user_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;

            // Upsert rather than insert: calling this method means the token
            // was just used, so the last accessed time advances either way.
            sqlx::query(
                "insert into cache_stored_token \
                 (keyring_type, token_name, boundary_addr, auth_token_id, user_id, last_accessed_time) \
                 values (?, ?, ?, ?, ?, ?) \
                 on conflict (keyring_type, token_name) do update set \
                 auth_token_id = excluded.auth_token_id, \
                 boundary_addr = excluded.boundary_addr, \
                 user_id = excluded.user_id, \
                 last_accessed_time = excluded.last_accessed_time",
            )
            .bind(keyring_type)
            .bind(token_name)
            .bind(boundary_addr)
            .bind(&at.id)
            .bind(&at.user_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;

            let count: i64 = sqlx::query_scalar("select count(*) from cache_stored_token")
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
            if count > STORED_TOKEN_LIMIT {
                sqlx::query(
                    "delete from cache_stored_token where (keyring_type, token_name) in \
                     (select keyring_type, token_name from cache_stored_token \
                      order by last_accessed_time asc limit 1)",
                )
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
            }

            tx.commit().await.map_err(|e| Error::from_sqlx(OP, e))
        })
        .await?;

        // A token may have been evicted or moved to a different address, so
        // sweep users that lost their last token.
        self.cleanup_orphaned_users().await
    }

    /// The auth token id stored under `(keyring_type, token_name)`, if any.
    /// A row stored for a different address reads as absent.
    pub async fn lookup_stored_auth_token_id(
        &self,
        boundary_addr: &str,
        token_name: &str,
        keyring_type: &str,
        opts: LookupOptions,
    ) -> Result<Option<String>> {
        const OP: &str = "cache.lookup_stored_auth_token_id";
        Ok(self
            .lookup_stored_token(OP, boundary_addr, token_name, keyring_type, opts)
            .await?
            .map(|t| t.auth_token_id))
    }

    pub(crate) async fn lookup_stored_token(
        &self,
        op: &'static str,
        boundary_addr: &str,
        token_name: &str,
        keyring_type: &str,
        opts: LookupOptions,
    ) -> Result<Option<StoredToken>> {
        if boundary_addr.is_empty() {
            return Err(Error::invalid_parameter(op, "boundary address is empty"));
        }
        if token_name.is_empty() {
            return Err(Error::invalid_parameter(op, "token name is empty"));
        }
        if keyring_type.is_empty() {
            return Err(Error::invalid_parameter(op, "keyring type is empty"));
        }

        let row: Option<StoredTokenRow> = sqlx::query_as(
            "select keyring_type, token_name, boundary_addr, auth_token_id, user_id, last_accessed_time \
             from cache_stored_token where keyring_type = ? and token_name = ?",
        )
        .bind(keyring_type)
        .bind(token_name)
        .fetch_optional(self.store.pool())
        .await
        .map_err(|e| Error::from_sqlx(op, e))?;

        let token = match row {
            Some(row) => row.into_token(op)?,
            None => return Ok(None),
        };
        if token.boundary_addr != boundary_addr {
            // A stored token under another address is not the one asked for.
            return Ok(None);
        }

        if opts.update_last_accessed_time {
            retry(op, || async {
                sqlx::query(
                    "update cache_stored_token set last_accessed_time = ? \
                     where keyring_type = ? and token_name = ?",
                )
                .bind(to_millis(Utc::now()))
                .bind(keyring_type)
                .bind(token_name)
                .execute(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(op, e))?;
                Ok(())
            })
            .await?;
        }
        Ok(Some(token))
    }

    /// Strict delete: exactly one row must go away.
    pub async fn delete_stored_token(&self, token: &StoredToken) -> Result<()> {
        const OP: &str = "cache.delete_stored_token";
        let deleted = self.delete_stored_token_rows(OP, token).await;
        let cleanup = self.cleanup_orphaned_users().await;
        let deleted = deleted?;
        cleanup?;
        match deleted {
            1 => Ok(()),
            0 => Err(Error::record_not_found(OP, "stored token not found when attempting deletion")),
            _ => Err(Error::multiple_records(OP, "multiple stored tokens deleted when one was requested")),
        }
    }

    /// Idempotent delete: removing an absent row is not an error. Returns
    /// the number of rows deleted.
    pub async fn delete_stored_token_idempotent(&self, token: &StoredToken) -> Result<u64> {
        const OP: &str = "cache.delete_stored_token_idempotent";
        let deleted = self.delete_stored_token_rows(OP, token).await;
        let cleanup = self.cleanup_orphaned_users().await;
        let deleted = deleted?;
        cleanup?;
        Ok(deleted)
    }

    async fn delete_stored_token_rows(&self, op: &'static str, token: &StoredToken) -> Result<u64> {
        if token.token_name.is_empty() {
            return Err(Error::invalid_parameter(op, "missing token name"));
        }
        if token.keyring_type.is_empty() {
            return Err(Error::invalid_parameter(op, "missing keyring type"));
        }
        retry(op, || async {
            let res = sqlx::query("delete from cache_stored_token where keyring_type = ? and token_name = ?")
                .bind(&token.keyring_type)
                .bind(&token.token_name)
                .execute(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(op, e))?;
            Ok(res.rows_affected())
        })
        .await
    }

    /// Remove stored tokens that have not been used within the staleness
    /// horizon.
    pub async fn remove_stale_stored_tokens(&self) -> Result<()> {
        const OP: &str = "cache.remove_stale_stored_tokens";
        let horizon = Utc::now() - Duration::hours(STORED_TOKEN_STALENESS_HOURS);
        retry(OP, || async {
            sqlx::query("delete from cache_stored_token where last_accessed_time < ?")
                .bind(to_millis(horizon))
                .execute(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
            Ok(())
        })
        .await?;
        self.cleanup_orphaned_users().await
    }

    /// Delete users no longer referenced by any stored token. Their cached
    /// targets cascade away with them. Safe to call repeatedly.
    pub async fn cleanup_orphaned_users(&self) -> Result<()> {
        const OP: &str = "cache.cleanup_orphaned_users";
        retry(OP, || async {
            sqlx::query(
                "delete from cache_user where not exists \
                 (select 1 from cache_stored_token t \
                  where t.boundary_addr = cache_user.boundary_addr and t.user_id = cache_user.user_id)",
            )
            .execute(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
            Ok(())
        })
        .await
    }

    pub async fn list_stored_tokens(&self) -> Result<Vec<StoredToken>> {
        const OP: &str = "cache.list_stored_tokens";
        let rows: Vec<StoredTokenRow> = sqlx::query_as(
            "select keyring_type, token_name, boundary_addr, auth_token_id, user_id, last_accessed_time \
             from cache_stored_token",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| Error::from_sqlx(OP, e))?;
        rows.into_iter().map(|r| r.into_token(OP)).collect()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        const OP: &str = "cache.list_users";
        let rows: Vec<(String, String)> =
            sqlx::query_as("select boundary_addr, user_id from cache_user")
                .fetch_all(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
        Ok(rows
            .into_iter()
            .map(|(boundary_addr, user_id)| User { boundary_addr, user_id })
            .collect())
    }

    /// Record an api error for later inspection; one row per
    /// `(token name, resource kind)`, refreshed on repeat failures.
    pub async fn save_api_error(
        &self,
        token_name: &str,
        resource_kind: ResourceKind,
        err: &Error,
    ) -> Result<()> {
        const OP: &str = "cache.save_api_error";
        if token_name.is_empty() {
            return Err(Error::invalid_parameter(OP, "token name is empty"));
        }
        let msg = err.to_string();
        retry(OP, || async {
            sqlx::query(
                "insert into cache_api_error (token_name, resource_type, error, create_time) \
                 values (?, ?, ?, ?) \
                 on conflict (token_name, resource_type) do update set \
                 error = excluded.error, create_time = excluded.create_time",
            )
            .bind(token_name)
            .bind(resource_kind.as_str())
            .bind(&msg)
            .bind(to_millis(Utc::now()))
            .execute(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
            Ok(())
        })
        .await
    }

    /// Replace the cached targets for a user with a fresh snapshot, in one
    /// transaction.
    pub(crate) async fn replace_cached_targets(&self, user: &User, targets: &[Target]) -> Result<()> {
        const OP: &str = "cache.replace_cached_targets";
        if user.user_id.is_empty() {
            return Err(Error::invalid_parameter(OP, "user id is missing"));
        }
        if user.boundary_addr.is_empty() {
            return Err(Error::invalid_parameter(OP, "boundary address is missing"));
        }
        let known: Option<(String,)> =
            sqlx::query_as("select user_id from cache_user where boundary_addr = ? and user_id = ?")
                .bind(&user.boundary_addr)
                .bind(&user.user_id)
                .fetch_optional(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
        if known.is_none() {
            return Err(Error::not_found(OP, format!("user {} is not known to the cache", user.user_id)));
        }

        let mut items = Vec::with_capacity(targets.len());
        for t in targets {
            items.push(serde_json::to_string(t).map_err(|e| Error::encoding(OP, e))?);
        }

        retry(OP, || async {
            let mut tx = self.store.pool().begin().await.map_err(|e| Error::from_sqlx(OP, e))?;
            sqlx::query("delete from cache_target where boundary_addr = ? and boundary_user_id = ?")
                .bind(&user.boundary_addr)
                .bind(&user.user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
            for (t, item) in targets.iter().zip(&items) {
                sqlx::query(
                    "insert into cache_target \
                     (boundary_addr, boundary_user_id, id, name, description, address, item) \
                     values (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&user.boundary_addr)
                .bind(&user.user_id)
                .bind(&t.public_id)
                .bind(&t.name)
                .bind(&t.description)
                .bind(&t.address)
                .bind(item)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
            }
            tx.commit().await.map_err(|e| Error::from_sqlx(OP, e))
        })
        .await
    }

    /// All cached targets for the calling user.
    pub async fn list_targets(
        &self,
        boundary_addr: &str,
        token_name: &str,
        keyring_type: &str,
    ) -> Result<Vec<Target>> {
        const OP: &str = "cache.list_targets";
        let token = self
            .lookup_stored_token(OP, boundary_addr, token_name, keyring_type, LookupOptions::default())
            .await?
            .ok_or_else(|| Error::not_found(OP, "stored auth token not found"))?;
        self.search_targets(OP, &token, "1 = 1", Vec::new()).await
    }

    /// Cached targets for the calling user matching a query over the target
    /// columns, e.g. `name % 'prod' and address % '10.'`.
    pub async fn query_targets(
        &self,
        boundary_addr: &str,
        token_name: &str,
        keyring_type: &str,
        query: &str,
    ) -> Result<Vec<Target>> {
        const OP: &str = "cache.query_targets";
        if query.is_empty() {
            return Err(Error::invalid_parameter(OP, "query is empty"));
        }
        let token = self
            .lookup_stored_token(OP, boundary_addr, token_name, keyring_type, LookupOptions::default())
            .await?
            .ok_or_else(|| Error::not_found(OP, "stored auth token not found"))?;
        let compiled = compile_query(OP, query)?;
        self.search_targets(OP, &token, &compiled.condition, compiled.args).await
    }

    async fn search_targets(
        &self,
        op: &'static str,
        token: &StoredToken,
        condition: &str,
        args: Vec<String>,
    ) -> Result<Vec<Target>> {
        let sql = format!(
            "select item from cache_target \
             where ({condition}) and boundary_addr = ? and boundary_user_id = ?"
        );
        let mut q = sqlx::query_scalar::<_, String>(&sql);
        for arg in &args {
            q = q.bind(arg);
        }
        let items: Vec<String> = q
            .bind(&token.boundary_addr)
            .bind(&token.user_id)
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(op, e))?;

        items
            .iter()
            .map(|item| serde_json::from_str(item).map_err(|e| Error::encoding(op, e)))
            .collect()
    }
}
