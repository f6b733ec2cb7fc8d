//! Target rows and the target scan source.
//!
//! Targets are the first resource kind served through the pagination engine.
//! Deletes leave a tombstone in `target_deleted_id` so refresh phases can
//! report removed ids, and list responses carry a maintained row-count
//! approximation instead of a `count(*)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::{Error, Result};
use crate::listtoken::Item;
use crate::pagination::ScanSource;
use crate::resource::{new_public_id, validate_public_id, Resource, ResourceKind};
use crate::store::{from_millis, retry, to_millis, Store};

/// A connectable target. The serialized form of this struct is what the
/// client cache stores per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub public_id: String,
    pub name: String,
    pub description: String,
    pub address: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Resource for Target {
    fn public_id(&self) -> &str {
        &self.public_id
    }
    fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }
    fn update_time(&self) -> DateTime<Utc> {
        self.update_time
    }
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Target
    }
}

#[derive(FromRow)]
struct TargetRow {
    public_id: String,
    name: String,
    description: String,
    address: String,
    create_time: i64,
    update_time: i64,
}

impl TargetRow {
    fn into_target(self, op: &'static str) -> Result<Target> {
        Ok(Target {
            public_id: self.public_id,
            name: self.name,
            description: self.description,
            address: self.address,
            create_time: from_millis(op, self.create_time)?,
            update_time: from_millis(op, self.update_time)?,
        })
    }
}

const TARGET_COLUMNS: &str = "public_id, name, description, address, create_time, update_time";

/// Repository for targets over the embedded store.
#[derive(Clone)]
pub struct TargetStore {
    store: Store,
}

impl TargetStore {
    pub fn new(store: Store) -> Self {
        TargetStore { store }
    }

    /// Create a target with a fresh public id.
    pub async fn create_target(
        &self,
        name: &str,
        description: &str,
        address: &str,
    ) -> Result<Target> {
        const OP: &str = "targets.create_target";
        if name.is_empty() {
            return Err(Error::invalid_parameter(OP, "missing name"));
        }
        let now = from_millis(OP, to_millis(Utc::now()))?;
        let target = Target {
            public_id: new_public_id(ResourceKind::Target),
            name: name.to_string(),
            description: description.to_string(),
            address: address.to_string(),
            create_time: now,
            update_time: now,
        };
        retry(OP, || async {
            sqlx::query(
                "insert into target (public_id, name, description, address, create_time, update_time) \
                 values (?, ?, ?, ?, ?, ?)",
            )
            .bind(&target.public_id)
            .bind(&target.name)
            .bind(&target.description)
            .bind(&target.address)
            .bind(to_millis(target.create_time))
            .bind(to_millis(target.update_time))
            .execute(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
            Ok(())
        })
        .await?;
        Ok(target)
    }

    /// Update a target's name, description or address, advancing its update
    /// time.
    pub async fn update_target(
        &self,
        public_id: &str,
        name: Option<&str>,
        description: Option<&str>,
        address: Option<&str>,
    ) -> Result<Target> {
        const OP: &str = "targets.update_target";
        validate_public_id(OP, ResourceKind::Target, public_id)?;
        if name.is_none() && description.is_none() && address.is_none() {
            return Err(Error::invalid_parameter(OP, "no fields to update"));
        }
        retry(OP, || async {
            let res = sqlx::query(
                "update target set \
                 name = coalesce(?, name), \
                 description = coalesce(?, description), \
                 address = coalesce(?, address), \
                 update_time = max(update_time, ?) \
                 where public_id = ?",
            )
            .bind(name)
            .bind(description)
            .bind(address)
            .bind(to_millis(Utc::now()))
            .bind(public_id)
            .execute(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
            if res.rows_affected() == 0 {
                return Err(Error::record_not_found(OP, format!("target {public_id} not found")));
            }
            Ok(())
        })
        .await?;
        self.lookup_target(public_id)
            .await?
            .ok_or_else(|| Error::internal(OP, "target vanished after update"))
    }

    /// Delete a target, recording a tombstone in the same transaction so
    /// refresh phases report the id.
    pub async fn delete_target(&self, public_id: &str) -> Result<()> {
        const OP: &str = "targets.delete_target";
        validate_public_id(OP, ResourceKind::Target, public_id)?;
        retry(OP, || async {
            let mut tx = self.store.pool().begin().await.map_err(|e| Error::from_sqlx(OP, e))?;
            let res = sqlx::query("delete from target where public_id = ?")
                .bind(public_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
            if res.rows_affected() == 0 {
                return Err(Error::record_not_found(OP, format!("target {public_id} not found")));
            }
            sqlx::query(
                "insert into target_deleted_id (public_id, delete_time) values (?, ?) \
                 on conflict (public_id) do update set delete_time = excluded.delete_time",
            )
            .bind(public_id)
            .bind(to_millis(Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
            tx.commit().await.map_err(|e| Error::from_sqlx(OP, e))
        })
        .await
    }

    pub async fn lookup_target(&self, public_id: &str) -> Result<Option<Target>> {
        const OP: &str = "targets.lookup_target";
        validate_public_id(OP, ResourceKind::Target, public_id)?;
        let row: Option<TargetRow> =
            sqlx::query_as(&format!("select {TARGET_COLUMNS} from target where public_id = ?"))
                .bind(public_id)
                .fetch_optional(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
        row.map(|r| r.into_target(OP)).transpose()
    }

    /// Recompute the stored row-count approximation for targets. Run out of
    /// band; list responses read the stored value.
    pub async fn analyze_estimate(&self) -> Result<()> {
        const OP: &str = "targets.analyze_estimate";
        retry(OP, || async {
            sqlx::query(
                "insert into resource_count_estimate (resource_kind, estimate, update_time) \
                 select 'target', count(*), ? from target where 1 = 1 \
                 on conflict (resource_kind) do update set \
                 estimate = excluded.estimate, update_time = excluded.update_time",
            )
            .bind(to_millis(Utc::now()))
            .execute(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ScanSource<Target> for TargetStore {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Target
    }

    async fn list(
        &self,
        limit: usize,
        start_after: Option<&Item>,
    ) -> Result<(Vec<Target>, DateTime<Utc>)> {
        const OP: &str = "targets.list";
        // The embedded store shares the process clock, so the reading
        // transaction's timestamp is taken at query issue.
        let tx_now = Utc::now();
        let rows: Vec<TargetRow> = match start_after {
            None => sqlx::query_as(&format!(
                "select {TARGET_COLUMNS} from target \
                 order by create_time desc, public_id asc limit ?"
            ))
            .bind(limit as i64)
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?,
            Some(after) => {
                let create_time = after
                    .create_time
                    .ok_or_else(|| Error::invalid_parameter(OP, "boundary item is missing its create time"))?;
                sqlx::query_as(&format!(
                    "select {TARGET_COLUMNS} from target \
                     where (create_time, public_id) < (?, ?) \
                     order by create_time desc, public_id asc limit ?"
                ))
                .bind(to_millis(create_time))
                .bind(&after.public_id)
                .bind(limit as i64)
                .fetch_all(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?
            }
        };
        let items = rows.into_iter().map(|r| r.into_target(OP)).collect::<Result<_>>()?;
        Ok((items, tx_now))
    }

    async fn list_updated_after(
        &self,
        lower_bound: DateTime<Utc>,
        limit: usize,
        start_after: Option<&Item>,
    ) -> Result<(Vec<Target>, DateTime<Utc>)> {
        const OP: &str = "targets.list_updated_after";
        let tx_now = Utc::now();
        let rows: Vec<TargetRow> = match start_after {
            None => sqlx::query_as(&format!(
                "select {TARGET_COLUMNS} from target \
                 where update_time > ? \
                 order by update_time desc, public_id asc limit ?"
            ))
            .bind(to_millis(lower_bound))
            .bind(limit as i64)
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?,
            Some(after) => {
                let update_time = after
                    .update_time
                    .ok_or_else(|| Error::invalid_parameter(OP, "boundary item is missing its update time"))?;
                sqlx::query_as(&format!(
                    "select {TARGET_COLUMNS} from target \
                     where update_time > ? \
                     and (update_time, public_id) < (?, ?) \
                     order by update_time desc, public_id asc limit ?"
                ))
                .bind(to_millis(lower_bound))
                .bind(to_millis(update_time))
                .bind(&after.public_id)
                .bind(limit as i64)
                .fetch_all(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?
            }
        };
        let items = rows.into_iter().map(|r| r.into_target(OP)).collect::<Result<_>>()?;
        Ok((items, tx_now))
    }

    async fn list_deleted_ids(&self, since: DateTime<Utc>) -> Result<(Vec<String>, DateTime<Utc>)> {
        const OP: &str = "targets.list_deleted_ids";
        let tx_now = Utc::now();
        let ids: Vec<String> =
            sqlx::query_scalar("select public_id from target_deleted_id where delete_time >= ?")
                .bind(to_millis(since))
                .fetch_all(self.store.pool())
                .await
                .map_err(|e| Error::from_sqlx(OP, e))?;
        Ok((ids, tx_now))
    }

    async fn estimated_count(&self) -> Result<i64> {
        const OP: &str = "targets.estimated_count";
        let estimate: Option<i64> = sqlx::query_scalar(
            "select estimate from resource_count_estimate where resource_kind = 'target'",
        )
        .fetch_optional(self.store.pool())
        .await
        .map_err(|e| Error::from_sqlx(OP, e))?;
        Ok(estimate.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn target_store() -> TargetStore {
        TargetStore::new(Store::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_lookup_update_delete() {
        let ts = target_store().await;
        let t = ts.create_target("db", "primary database", "10.0.0.5:5432").await.unwrap();
        assert!(t.public_id.starts_with("t_"));

        let found = ts.lookup_target(&t.public_id).await.unwrap().unwrap();
        assert_eq!(found, t);

        let updated = ts
            .update_target(&t.public_id, Some("db-primary"), None, None)
            .await
            .unwrap();
        assert_eq!(updated.name, "db-primary");
        assert_eq!(updated.description, "primary database");
        assert!(updated.update_time >= t.update_time);

        ts.delete_target(&t.public_id).await.unwrap();
        assert!(ts.lookup_target(&t.public_id).await.unwrap().is_none());

        let err = ts.delete_target(&t.public_id).await.unwrap_err();
        assert!(matches!(err, Error::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn delete_records_tombstone() {
        let ts = target_store().await;
        let before = Utc::now() - chrono::Duration::seconds(1);
        let t = ts.create_target("web", "", "web.internal:80").await.unwrap();
        ts.delete_target(&t.public_id).await.unwrap();

        let (ids, _) = ts.list_deleted_ids(before).await.unwrap();
        assert_eq!(ids, vec![t.public_id]);

        // Tombstones older than the bound are not reported.
        let (ids, _) = ts.list_deleted_ids(Utc::now() + chrono::Duration::seconds(5)).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn estimate_reads_stored_row() {
        let ts = target_store().await;
        assert_eq!(ts.estimated_count().await.unwrap(), 0);

        ts.create_target("one", "", "").await.unwrap();
        ts.create_target("two", "", "").await.unwrap();
        // Until analyze runs, the estimate lags the real count.
        assert_eq!(ts.estimated_count().await.unwrap(), 0);

        ts.analyze_estimate().await.unwrap();
        assert_eq!(ts.estimated_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejects_foreign_ids() {
        let ts = target_store().await;
        let err = ts.lookup_target("s_abc123").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPublicId { .. }));
    }
}
