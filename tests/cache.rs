//! Token cache behavior: upserts, LRU eviction, staleness, orphaned-user
//! cleanup and the periodic target refresh.

mod common;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use gatehouse::cache::{LookupOptions, StoredToken, TargetRetrieval, STORED_TOKEN_LIMIT};
use gatehouse::errors::{Error, Result};
use gatehouse::store::targets::Target;
use gatehouse::store::Store;

use common::{set_token_last_accessed, test_repository, TestKeyring};

const ADDR: &str = "https://gatehouse.internal";

fn make_target(id: &str, name: &str, address: &str) -> Target {
    let now = Utc::now();
    Target {
        public_id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        address: address.to_string(),
        create_time: now - Duration::hours(1),
        update_time: now - Duration::hours(1),
    }
}

/// Scripted stand-in for the remote list endpoint: maps auth tokens to
/// results and records the tokens it was called with.
#[derive(Default)]
struct ScriptedRetrieval {
    by_token: HashMap<String, Vec<Target>>,
    failing_tokens: Vec<String>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl TargetRetrieval for ScriptedRetrieval {
    async fn list_targets(&self, _addr: &str, auth_token: &str) -> Result<Vec<Target>> {
        self.calls.lock().unwrap().push(auth_token.to_string());
        if self.failing_tokens.iter().any(|t| t == auth_token) {
            return Err(Error::transport("test.retrieval", "listing failed"));
        }
        Ok(self.by_token.get(auth_token).cloned().unwrap_or_default())
    }
}

async fn count_rows(store: &Store, table: &str) -> i64 {
    sqlx::query_scalar(&format!("select count(*) from {table}"))
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn add_is_idempotent_and_advances_last_accessed() {
    let (store, repo, _keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");

    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();
    assert_eq!(count_rows(&store, "cache_stored_token").await, 1);

    let past = Utc::now() - Duration::hours(2);
    set_token_last_accessed(&store, "keyring", "default", past).await;

    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();
    assert_eq!(count_rows(&store, "cache_stored_token").await, 1);

    let tokens = repo.list_stored_tokens().await.unwrap();
    assert!(tokens[0].last_accessed_time > past);
}

#[tokio::test]
async fn add_validates_against_keyring() {
    let (_store, repo, keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");

    // Argument validation happens before anything else.
    assert!(repo.add_stored_token("", "default", "keyring", &at.id).await.is_err());
    assert!(repo.add_stored_token(ADDR, "", "keyring", &at.id).await.is_err());
    assert!(repo.add_stored_token(ADDR, "default", "", &at.id).await.is_err());

    // Wrong id for the keyring entry.
    let err = repo.add_stored_token(ADDR, "default", "keyring", "at_other").await.unwrap_err();
    assert!(err.to_string().contains("doesn't match"));

    // No live keyring entry at all.
    keyring.revoke("keyring", "default");
    let err = repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap_err();
    assert!(err.to_string().contains("keyring"));
}

#[tokio::test]
async fn lru_eviction_spares_recently_used_tokens() {
    let (store, repo, _keyring) = test_repository().await;

    let base = Utc::now() - Duration::hours(1);
    for i in 0..STORED_TOKEN_LIMIT {
        let name = format!("token{i:02}");
        let at = TestKeyring::token_for(&name);
        repo.add_stored_token(ADDR, &name, "keyring", &at.id).await.unwrap();
        // Pin distinct access times in insertion order.
        set_token_last_accessed(&store, "keyring", &name, base + Duration::seconds(i)).await;
    }
    assert_eq!(count_rows(&store, "cache_stored_token").await, STORED_TOKEN_LIMIT);

    // Touch the first token so the second is now the least recently used.
    let at = TestKeyring::token_for("token00");
    repo.add_stored_token(ADDR, "token00", "keyring", &at.id).await.unwrap();

    let at = TestKeyring::token_for("overflow");
    repo.add_stored_token(ADDR, "overflow", "keyring", &at.id).await.unwrap();

    assert_eq!(count_rows(&store, "cache_stored_token").await, STORED_TOKEN_LIMIT);
    let names: Vec<String> = repo
        .list_stored_tokens()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.token_name)
        .collect();
    assert!(names.contains(&"token00".to_string()));
    assert!(names.contains(&"overflow".to_string()));
    assert!(!names.contains(&"token01".to_string()));
}

#[tokio::test]
async fn lookup_honours_address_and_update_option() {
    let (store, repo, _keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");
    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();

    let found = repo
        .lookup_stored_auth_token_id(ADDR, "default", "keyring", LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(found.as_deref(), Some(at.id.as_str()));

    // A different address reads as absent.
    let found = repo
        .lookup_stored_auth_token_id("https://elsewhere", "default", "keyring", LookupOptions::default())
        .await
        .unwrap();
    assert!(found.is_none());

    let absent = repo
        .lookup_stored_auth_token_id(ADDR, "missing", "keyring", LookupOptions::default())
        .await
        .unwrap();
    assert!(absent.is_none());

    // The update option advances the access time on a hit.
    let past = Utc::now() - Duration::hours(2);
    set_token_last_accessed(&store, "keyring", "default", past).await;
    repo.lookup_stored_auth_token_id(
        ADDR,
        "default",
        "keyring",
        LookupOptions { update_last_accessed_time: true },
    )
    .await
    .unwrap();
    let after = repo.list_stored_tokens().await.unwrap()[0].last_accessed_time;
    assert!(after > past);
}

#[tokio::test]
async fn strict_and_idempotent_delete() {
    let (_store, repo, _keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");
    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();

    let token = repo.list_stored_tokens().await.unwrap().remove(0);
    repo.delete_stored_token(&token).await.unwrap();

    // Strict delete of an absent row asserts presence.
    let err = repo.delete_stored_token(&token).await.unwrap_err();
    assert!(matches!(err, Error::RecordNotFound { .. }));

    // The idempotent variant reports zero rows instead.
    let deleted = repo.delete_stored_token_idempotent(&token).await.unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn stale_tokens_are_swept_with_their_users() {
    let (store, repo, _keyring) = test_repository().await;
    for name in ["fresh", "stale"] {
        let at = TestKeyring::token_for(name);
        repo.add_stored_token(ADDR, name, "keyring", &at.id).await.unwrap();
    }
    set_token_last_accessed(&store, "keyring", "stale", Utc::now() - Duration::hours(37)).await;

    repo.remove_stale_stored_tokens().await.unwrap();

    let names: Vec<String> =
        repo.list_stored_tokens().await.unwrap().into_iter().map(|t| t.token_name).collect();
    assert_eq!(names, vec!["fresh".to_string()]);
    // The stale token's user went with it.
    let users = repo.list_users().await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id, "u_fresh");
}

#[tokio::test]
async fn user_delete_cascades_to_cached_targets() {
    let (store, repo, _keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");
    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();

    let retrieval = ScriptedRetrieval {
        by_token: HashMap::from([(
            at.token.clone(),
            vec![make_target("t_one", "one", "10.0.0.1:22"), make_target("t_two", "two", "10.0.0.2:22")],
        )]),
        ..Default::default()
    };
    repo.refresh(&retrieval).await.unwrap();
    assert_eq!(count_rows(&store, "cache_target").await, 2);

    // Deleting the last stored token orphans the user; cleanup removes the
    // user row and the targets cascade away.
    let token = repo.list_stored_tokens().await.unwrap().remove(0);
    repo.delete_stored_token(&token).await.unwrap();
    assert_eq!(count_rows(&store, "cache_user").await, 0);
    assert_eq!(count_rows(&store, "cache_target").await, 0);

    // A second cleanup is a no-op.
    repo.cleanup_orphaned_users().await.unwrap();
    assert_eq!(count_rows(&store, "cache_user").await, 0);
}

#[tokio::test]
async fn refresh_prefers_most_recently_used_token() {
    let (store, repo, _keyring) = test_repository().await;

    // Two tokens for the same user; "alice.newer" was used most recently.
    for name in ["alice.older", "alice.newer"] {
        let at = TestKeyring::token_for(name);
        repo.add_stored_token(ADDR, name, "keyring", &at.id).await.unwrap();
    }
    set_token_last_accessed(&store, "keyring", "alice.older", Utc::now() - Duration::hours(3)).await;
    set_token_last_accessed(&store, "keyring", "alice.newer", Utc::now() - Duration::hours(1)).await;

    let newer = TestKeyring::token_for("alice.newer");
    let retrieval = ScriptedRetrieval {
        by_token: HashMap::from([(newer.token.clone(), vec![make_target("t_new", "new", "")])]),
        ..Default::default()
    };
    repo.refresh(&retrieval).await.unwrap();

    // The most recently used token succeeds first, so the older one is
    // never tried.
    let calls = retrieval.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![newer.token]);

    let targets = repo.list_targets(ADDR, "alice.newer", "keyring").await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].public_id, "t_new");
}

#[tokio::test]
async fn refresh_deletes_tokens_missing_from_keyring() {
    let (store, repo, keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");
    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();

    keyring.revoke("keyring", "default");
    let retrieval = ScriptedRetrieval::default();
    repo.refresh(&retrieval).await.unwrap();

    assert_eq!(count_rows(&store, "cache_stored_token").await, 0);
    assert_eq!(count_rows(&store, "cache_user").await, 0);
    assert!(retrieval.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn refresh_accumulates_errors_and_records_them() {
    let (store, repo, _keyring) = test_repository().await;
    for name in ["broken", "working"] {
        let at = TestKeyring::token_for(name);
        repo.add_stored_token(ADDR, name, "keyring", &at.id).await.unwrap();
    }

    let working = TestKeyring::token_for("working");
    let retrieval = ScriptedRetrieval {
        by_token: HashMap::from([(working.token.clone(), vec![make_target("t_ok", "ok", "")])]),
        failing_tokens: vec![TestKeyring::token_for("broken").token],
        ..Default::default()
    };

    // The broken user's failure joins the returned error but does not stop
    // the working user's refresh.
    let err = repo.refresh(&retrieval).await.unwrap_err();
    assert!(err.to_string().contains("listing failed"));
    assert_eq!(count_rows(&store, "cache_target").await, 1);

    // The failure was recorded for inspection.
    let recorded: i64 =
        sqlx::query_scalar("select count(*) from cache_api_error where token_name = 'broken'")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(recorded, 1);
}

#[tokio::test]
async fn refresh_replaces_the_snapshot() {
    let (_store, repo, _keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");
    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();

    let retrieval = ScriptedRetrieval {
        by_token: HashMap::from([(
            at.token.clone(),
            vec![make_target("t_one", "one", ""), make_target("t_two", "two", "")],
        )]),
        ..Default::default()
    };
    repo.refresh(&retrieval).await.unwrap();

    let retrieval = ScriptedRetrieval {
        by_token: HashMap::from([(at.token.clone(), vec![make_target("t_three", "three", "")])]),
        ..Default::default()
    };
    repo.refresh(&retrieval).await.unwrap();

    let targets = repo.list_targets(ADDR, "default", "keyring").await.unwrap();
    let ids: Vec<&str> = targets.iter().map(|t| t.public_id.as_str()).collect();
    assert_eq!(ids, vec!["t_three"]);
}

#[tokio::test]
async fn query_targets_filters_cached_rows() {
    let (_store, repo, _keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");
    repo.add_stored_token(ADDR, "default", "keyring", &at.id).await.unwrap();

    let retrieval = ScriptedRetrieval {
        by_token: HashMap::from([(
            at.token.clone(),
            vec![
                make_target("t_prod1", "prod-db", "10.0.0.1:5432"),
                make_target("t_prod2", "prod-web", "10.0.0.2:80"),
                make_target("t_dev1", "dev-db", "10.1.0.1:5432"),
            ],
        )]),
        ..Default::default()
    };
    repo.refresh(&retrieval).await.unwrap();

    let all = repo.list_targets(ADDR, "default", "keyring").await.unwrap();
    assert_eq!(all.len(), 3);

    let prod = repo
        .query_targets(ADDR, "default", "keyring", "name % 'prod'")
        .await
        .unwrap();
    assert_eq!(prod.len(), 2);

    let one = repo
        .query_targets(ADDR, "default", "keyring", "name % 'db' and address % '10.0.'")
        .await
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].public_id, "t_prod1");

    // Unknown callers get a not-found, not an empty listing.
    let err = repo.query_targets(ADDR, "missing", "keyring", "name = 'x'").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    // The owning-user columns are not queryable.
    let err = repo
        .query_targets(ADDR, "default", "keyring", "boundary_addr = 'x'")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));
}

#[tokio::test]
async fn delete_requires_key_fields() {
    let (_store, repo, _keyring) = test_repository().await;
    let token = StoredToken {
        keyring_type: String::new(),
        token_name: "x".to_string(),
        boundary_addr: String::new(),
        auth_token_id: String::new(),
        user_id: String::new(),
        last_accessed_time: Utc::now(),
    };
    assert!(repo.delete_stored_token(&token).await.is_err());
}

#[tokio::test]
async fn distinct_keyrings_store_distinct_tokens() {
    let (store, repo, _keyring) = test_repository().await;
    let at = TestKeyring::token_for("default");
    repo.add_stored_token(ADDR, "default", "keyring-a", &at.id).await.unwrap();
    repo.add_stored_token(ADDR, "default", "keyring-b", &at.id).await.unwrap();
    assert_eq!(count_rows(&store, "cache_stored_token").await, 2);
    // Both rows reference one user.
    assert_eq!(count_rows(&store, "cache_user").await, 1);
}
