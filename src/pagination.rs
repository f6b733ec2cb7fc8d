//! Generic page-filling engine for list endpoints.
//!
//! The engine drives a [`ScanSource`] to fill a page of filtered items,
//! coordinates the [`ListToken`] lifecycle and, during refresh phases,
//! collects the ids of resources deleted since the previous pass. It is
//! parametric over the resource type; the scan source supplies ordering and
//! the transaction timestamps the next token is built from.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::errors::{Error, Result};
use crate::listtoken::{Item, ListToken, Subtype};
use crate::resource::{Resource, ResourceKind};

/// Slack subtracted from refresh lower bounds and deleted-ids lower bounds
/// to absorb concurrent writers whose commits were not yet visible on the
/// previous pass. Because of it, refresh responses may repeat items and
/// deleted ids; callers apply both idempotently.
pub const DATABASE_READ_SLACK_SECS: i64 = 5;

fn read_slack() -> Duration {
    Duration::seconds(DATABASE_READ_SLACK_SECS)
}

/// A kind-specific adapter over the backing store. All listings are ordered
/// deterministically: `(create_time desc, public_id asc)` for [`Self::list`]
/// and `(update_time desc, public_id asc)` for [`Self::list_updated_after`].
/// The returned timestamp is the clock of the reading transaction and is
/// used verbatim to construct the next token.
#[async_trait]
pub trait ScanSource<T: Resource>: Send + Sync {
    fn resource_kind(&self) -> ResourceKind;

    /// Up to `limit` items ordered by create time, optionally starting after
    /// the given boundary item.
    async fn list(&self, limit: usize, start_after: Option<&Item>) -> Result<(Vec<T>, DateTime<Utc>)>;

    /// Up to `limit` items updated strictly after `lower_bound`, ordered by
    /// update time, optionally starting after the given boundary item.
    async fn list_updated_after(
        &self,
        lower_bound: DateTime<Utc>,
        limit: usize,
        start_after: Option<&Item>,
    ) -> Result<(Vec<T>, DateTime<Utc>)>;

    /// Ids of items deleted at or after `since`.
    async fn list_deleted_ids(&self, since: DateTime<Utc>) -> Result<(Vec<String>, DateTime<Utc>)>;

    /// An approximation of the total item count. Allowed to drift; never
    /// treated as authoritative.
    async fn estimated_count(&self) -> Result<i64>;
}

/// The outcome of one list request.
#[derive(Debug)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    /// Whether the current phase's data was fully enumerated.
    pub complete_listing: bool,
    pub estimated_item_count: i64,
    /// Ids deleted since the previous pass. Only populated during refresh
    /// phases; may repeat ids reported earlier.
    pub deleted_ids: Vec<String>,
    /// The token to present on the next request. Absent only when an initial
    /// listing returned no items at all.
    pub list_token: Option<ListToken>,
}

/// Start an initial pagination. Items are ordered by create time descending.
pub async fn list<T, S, F>(
    grants_hash: &[u8],
    page_size: usize,
    filter: F,
    source: &S,
) -> Result<ListResponse<T>>
where
    T: Resource,
    S: ScanSource<T>,
    F: Fn(&T) -> Result<bool>,
{
    const OP: &str = "pagination.list";
    validate_args(OP, grants_hash, page_size)?;

    let page = fill_page(source, Scan::Pagination, page_size, &filter, None).await?;
    let estimated_item_count = source.estimated_count().await?;

    let mut list_token = None;
    if let Some(last) = page.items.last() {
        let mut token = ListToken::new_pagination(
            page.list_time,
            source.resource_kind(),
            grants_hash,
            last.public_id(),
            last.create_time(),
        )?;
        if page.complete_listing {
            token.transition(true, None, page.list_time, page.list_time)?;
        }
        list_token = Some(token);
    }

    Ok(ListResponse {
        items: page.items,
        complete_listing: page.complete_listing,
        estimated_item_count,
        deleted_ids: Vec::new(),
        list_token,
    })
}

/// Continue an initial pagination. The token must be in the pagination stage.
pub async fn list_page<T, S, F>(
    grants_hash: &[u8],
    page_size: usize,
    filter: F,
    token: ListToken,
    source: &S,
) -> Result<ListResponse<T>>
where
    T: Resource,
    S: ScanSource<T>,
    F: Fn(&T) -> Result<bool>,
{
    const OP: &str = "pagination.list_page";
    validate_args(OP, grants_hash, page_size)?;
    token.validate(source.resource_kind(), grants_hash)?;
    if !matches!(token.subtype, Subtype::Pagination { .. }) {
        return Err(Error::invalid_parameter(OP, "token is not in the pagination stage"));
    }

    let start_after = token.last_item()?;
    let page = fill_page(source, Scan::Pagination, page_size, &filter, Some(start_after)).await?;
    let estimated_item_count = source.estimated_count().await?;

    let mut token = token;
    let last = page.items.last().map(Item::from_resource);
    token.transition(page.complete_listing, last.as_ref(), page.list_time, page.list_time)?;

    Ok(ListResponse {
        items: page.items,
        complete_listing: page.complete_listing,
        estimated_item_count,
        deleted_ids: Vec::new(),
        list_token: Some(token),
    })
}

/// Start a refresh phase. The token must be in the start-refresh stage.
/// Items are ordered by update time descending and may include items already
/// returned during earlier phases.
pub async fn list_refresh<T, S, F>(
    grants_hash: &[u8],
    page_size: usize,
    filter: F,
    token: ListToken,
    source: &S,
) -> Result<ListResponse<T>>
where
    T: Resource,
    S: ScanSource<T>,
    F: Fn(&T) -> Result<bool>,
{
    const OP: &str = "pagination.list_refresh";
    validate_args(OP, grants_hash, page_size)?;
    token.validate(source.resource_kind(), grants_hash)?;
    let (prev_upper, prev_deleted) = match &token.subtype {
        Subtype::StartRefresh { previous_phase_upper_bound, previous_deleted_ids_time } => {
            (*previous_phase_upper_bound, *previous_deleted_ids_time)
        }
        _ => return Err(Error::invalid_parameter(OP, "token is not in the start-refresh stage")),
    };

    let (deleted_ids, deleted_ids_time) =
        source.list_deleted_ids(prev_deleted - read_slack()).await?;
    let page = fill_page(
        source,
        Scan::Refresh { lower_bound: prev_upper - read_slack() },
        page_size,
        &filter,
        None,
    )
    .await?;
    let estimated_item_count = source.estimated_count().await?;

    let mut token = token;
    let last = page.items.last().map(Item::from_resource);
    token.transition(page.complete_listing, last.as_ref(), deleted_ids_time, page.list_time)?;

    Ok(ListResponse {
        items: page.items,
        complete_listing: page.complete_listing,
        estimated_item_count,
        deleted_ids,
        list_token: Some(token),
    })
}

/// Continue a refresh phase. The token must be in the refresh stage.
pub async fn list_refresh_page<T, S, F>(
    grants_hash: &[u8],
    page_size: usize,
    filter: F,
    token: ListToken,
    source: &S,
) -> Result<ListResponse<T>>
where
    T: Resource,
    S: ScanSource<T>,
    F: Fn(&T) -> Result<bool>,
{
    const OP: &str = "pagination.list_refresh_page";
    validate_args(OP, grants_hash, page_size)?;
    token.validate(source.resource_kind(), grants_hash)?;
    let (phase_lower, prev_deleted) = match &token.subtype {
        Subtype::Refresh { phase_lower_bound, previous_deleted_ids_time, .. } => {
            (*phase_lower_bound, *previous_deleted_ids_time)
        }
        _ => return Err(Error::invalid_parameter(OP, "token is not in the refresh stage")),
    };

    let (deleted_ids, deleted_ids_time) =
        source.list_deleted_ids(prev_deleted - read_slack()).await?;
    let start_after = token.last_item()?;
    let page = fill_page(
        source,
        Scan::Refresh { lower_bound: phase_lower - read_slack() },
        page_size,
        &filter,
        Some(start_after),
    )
    .await?;
    let estimated_item_count = source.estimated_count().await?;

    let mut token = token;
    let last = page.items.last().map(Item::from_resource);
    token.transition(page.complete_listing, last.as_ref(), deleted_ids_time, page.list_time)?;

    Ok(ListResponse {
        items: page.items,
        complete_listing: page.complete_listing,
        estimated_item_count,
        deleted_ids,
        list_token: Some(token),
    })
}

impl Item {
    /// Boundary item for a resource that was returned to the caller.
    pub fn from_resource<T: Resource>(r: &T) -> Self {
        Item {
            public_id: r.public_id().to_string(),
            create_time: Some(r.create_time()),
            update_time: Some(r.update_time()),
            resource_kind: r.resource_kind(),
        }
    }
}

fn validate_args(op: &'static str, grants_hash: &[u8], page_size: usize) -> Result<()> {
    if grants_hash.is_empty() {
        return Err(Error::invalid_parameter(op, "missing grants hash"));
    }
    if page_size < 1 {
        return Err(Error::invalid_parameter(op, "page size must be at least 1"));
    }
    Ok(())
}

enum Scan {
    Pagination,
    Refresh { lower_bound: DateTime<Utc> },
}

struct Page<T> {
    items: Vec<T>,
    complete_listing: bool,
    list_time: DateTime<Utc>,
}

/// Fill a page by repeatedly asking the source for `page_size + 1` items and
/// filtering. The extra item decides whether more data exists without a
/// second round trip; it is trimmed before returning. The page's list time
/// is the transaction timestamp of the first fetch.
async fn fill_page<T, S, F>(
    source: &S,
    scan: Scan,
    page_size: usize,
    filter: &F,
    start_after: Option<Item>,
) -> Result<Page<T>>
where
    T: Resource,
    S: ScanSource<T>,
    F: Fn(&T) -> Result<bool>,
{
    let limit = page_size + 1;
    let mut items: Vec<T> = Vec::with_capacity(limit);
    let mut list_time: Option<DateTime<Utc>> = None;
    let mut cursor = start_after;

    loop {
        let (page, tx_time) = match &scan {
            Scan::Pagination => source.list(limit, cursor.as_ref()).await?,
            Scan::Refresh { lower_bound } => {
                source.list_updated_after(*lower_bound, limit, cursor.as_ref()).await?
            }
        };
        list_time.get_or_insert(tx_time);

        let fetched = page.len();
        let mut last_seen = None;
        for item in page {
            last_seen = Some(Item::from_resource(&item));
            if filter(&item)? {
                items.push(item);
            }
            if items.len() == limit {
                break;
            }
        }
        if fetched < limit || items.len() == limit {
            break;
        }
        cursor = last_seen;
    }

    let complete_listing = items.len() < limit;
    if !complete_listing {
        items.truncate(page_size);
    }
    Ok(Page {
        items,
        complete_listing,
        // At least one fetch always happens, so the list time is set.
        list_time: list_time.unwrap_or_else(Utc::now),
    })
}
