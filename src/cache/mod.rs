//! The local cache: stored auth tokens, known users and their targets.
//!
//! The cache is a single-process mirror kept in the embedded store. Stored
//! tokens reference entries in the platform keyring rather than holding raw
//! tokens; users exist only while at least one stored token references them,
//! and cached targets ride along with their user.

mod query;
mod refresh;
mod repository;

pub use refresh::TargetRetrieval;
pub use repository::{LookupOptions, Repository, StoredToken, User};

/// Most stored tokens kept before the least recently used one is evicted.
pub const STORED_TOKEN_LIMIT: i64 = 50;

/// Stored tokens not used for this long are removed.
pub const STORED_TOKEN_STALENESS_HOURS: i64 = 36;
