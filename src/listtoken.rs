//! List endpoint tokens.
//!
//! A [`ListToken`] is handed back from list endpoints so callers can paginate
//! through an initial snapshot and afterwards ask for new, updated and
//! deleted resources. The token's subtype tracks where in that lifecycle the
//! caller is; transitions between subtypes form a small state machine:
//!
//! ```text
//!      ,---------------------.
//!      |   Initial request   |
//!      `---------------------'
//!       *         *
//!      /          | more pages in initial phase
//!     /           |
//!    |      ,---------------.
//!    |      |   Pagination  | *-. more results in this page
//!    |      `---------------' <-'
//!    |              *
//!    | no results   | end of initial phase
//!    |              |
//! ,----------------------.
//! |     StartRefresh     | *-. end of refresh phase
//! `----------------------' <-'
//!     *                ^
//!     | more results   | end of refresh phase
//!     |                *
//!  ,-------------.
//!  |   Refresh   | *-. more results in this page
//!  `-------------' <-'
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::resource::ResourceKind;

/// Tokens expire this long after their create time.
pub const LIST_TOKEN_TTL_DAYS: i64 = 30;

const WIRE_VERSION: u8 = 1;

/// The boundary item a token remembers: the last item of the previous page.
/// Pagination subtypes carry its create time, refresh subtypes its update
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub public_id: String,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub resource_kind: ResourceKind,
}

/// The lifecycle stage of a list token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Subtype {
    /// The initial snapshot is still being enumerated.
    Pagination {
        last_item_id: String,
        last_item_create_time: DateTime<Utc>,
    },
    /// The previous phase finished; the next request starts a refresh phase.
    StartRefresh {
        previous_phase_upper_bound: DateTime<Utc>,
        previous_deleted_ids_time: DateTime<Utc>,
    },
    /// A refresh phase is in progress.
    Refresh {
        phase_upper_bound: DateTime<Utc>,
        phase_lower_bound: DateTime<Utc>,
        previous_deleted_ids_time: DateTime<Utc>,
        last_item_id: String,
        last_item_update_time: DateTime<Utc>,
    },
}

/// A resumable cursor over a list endpoint. Opaque bytes to clients; see
/// [`ListToken::to_bytes`] and [`ListToken::from_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListToken {
    /// Constant for the lifetime of the token.
    pub create_time: DateTime<Utc>,
    /// The resource kind of the list endpoint this token belongs to.
    pub resource_kind: ResourceKind,
    /// Hash of the grants of the user who made the original request, used
    /// to detect permission changes between requests.
    #[serde(with = "grants_hash_serde")]
    pub grants_hash: Vec<u8>,
    pub subtype: Subtype,
}

impl ListToken {
    /// Create a token in the pagination stage.
    pub fn new_pagination(
        create_time: DateTime<Utc>,
        resource_kind: ResourceKind,
        grants_hash: &[u8],
        last_item_id: &str,
        last_item_create_time: DateTime<Utc>,
    ) -> Result<Self> {
        const OP: &str = "listtoken.new_pagination";
        validate_common(OP, create_time, grants_hash)?;
        if last_item_id.is_empty() {
            return Err(Error::invalid_parameter(OP, "missing last item id"));
        }
        if last_item_create_time > Utc::now() {
            return Err(Error::invalid_parameter(OP, "last item create time is in the future"));
        }
        Ok(ListToken {
            create_time,
            resource_kind,
            grants_hash: grants_hash.to_vec(),
            subtype: Subtype::Pagination {
                last_item_id: last_item_id.to_string(),
                last_item_create_time,
            },
        })
    }

    /// Create a token in the start-refresh stage.
    pub fn new_start_refresh(
        create_time: DateTime<Utc>,
        resource_kind: ResourceKind,
        grants_hash: &[u8],
        previous_deleted_ids_time: DateTime<Utc>,
        previous_phase_upper_bound: DateTime<Utc>,
    ) -> Result<Self> {
        const OP: &str = "listtoken.new_start_refresh";
        validate_common(OP, create_time, grants_hash)?;
        if previous_deleted_ids_time > Utc::now() {
            return Err(Error::invalid_parameter(OP, "previous deleted ids time is in the future"));
        }
        if previous_phase_upper_bound > Utc::now() {
            return Err(Error::invalid_parameter(OP, "previous phase upper bound is in the future"));
        }
        Ok(ListToken {
            create_time,
            resource_kind,
            grants_hash: grants_hash.to_vec(),
            subtype: Subtype::StartRefresh {
                previous_phase_upper_bound,
                previous_deleted_ids_time,
            },
        })
    }

    /// Create a token in the refresh stage.
    #[allow(clippy::too_many_arguments)]
    pub fn new_refresh(
        create_time: DateTime<Utc>,
        resource_kind: ResourceKind,
        grants_hash: &[u8],
        previous_deleted_ids_time: DateTime<Utc>,
        phase_upper_bound: DateTime<Utc>,
        phase_lower_bound: DateTime<Utc>,
        last_item_id: &str,
        last_item_update_time: DateTime<Utc>,
    ) -> Result<Self> {
        const OP: &str = "listtoken.new_refresh";
        validate_common(OP, create_time, grants_hash)?;
        if previous_deleted_ids_time > Utc::now() {
            return Err(Error::invalid_parameter(OP, "previous deleted ids time is in the future"));
        }
        if phase_upper_bound > Utc::now() {
            return Err(Error::invalid_parameter(OP, "phase upper bound is in the future"));
        }
        if phase_lower_bound > Utc::now() {
            return Err(Error::invalid_parameter(OP, "phase lower bound is in the future"));
        }
        if phase_lower_bound > phase_upper_bound {
            return Err(Error::invalid_parameter(OP, "phase lower bound is after phase upper bound"));
        }
        if last_item_id.is_empty() {
            return Err(Error::invalid_parameter(OP, "missing last item id"));
        }
        if last_item_update_time > Utc::now() {
            return Err(Error::invalid_parameter(OP, "last item update time is in the future"));
        }
        Ok(ListToken {
            create_time,
            resource_kind,
            grants_hash: grants_hash.to_vec(),
            subtype: Subtype::Refresh {
                phase_upper_bound,
                phase_lower_bound,
                previous_deleted_ids_time,
                last_item_id: last_item_id.to_string(),
                last_item_update_time,
            },
        })
    }

    /// The last item stored in the token, used as the paging cursor.
    /// Start-refresh tokens have no last item.
    pub fn last_item(&self) -> Result<Item> {
        const OP: &str = "listtoken.last_item";
        match &self.subtype {
            Subtype::Pagination { last_item_id, last_item_create_time } => Ok(Item {
                public_id: last_item_id.clone(),
                create_time: Some(*last_item_create_time),
                update_time: None,
                resource_kind: self.resource_kind,
            }),
            Subtype::Refresh { last_item_id, last_item_update_time, .. } => Ok(Item {
                public_id: last_item_id.clone(),
                create_time: None,
                update_time: Some(*last_item_update_time),
                resource_kind: self.resource_kind,
            }),
            Subtype::StartRefresh { .. } => {
                Err(Error::internal(OP, "start-refresh tokens have no last item"))
            }
        }
    }

    /// Advance the token to its next state. `complete_listing` means the
    /// current phase's data was fully enumerated; `last_item` is the last
    /// item returned to the caller (required when the listing was not
    /// complete); `deleted_ids_time` and `list_time` are the transaction
    /// timestamps of the deleted-ids read and the first page read.
    pub fn transition(
        &mut self,
        complete_listing: bool,
        last_item: Option<&Item>,
        deleted_ids_time: DateTime<Utc>,
        list_time: DateTime<Utc>,
    ) -> Result<()> {
        const OP: &str = "listtoken.transition";
        match &self.subtype {
            Subtype::Pagination { .. } => {
                if complete_listing {
                    // The next refresh phase lists both items and deleted ids
                    // relative to the create time of this token.
                    self.subtype = Subtype::StartRefresh {
                        previous_phase_upper_bound: self.create_time,
                        previous_deleted_ids_time: self.create_time,
                    };
                    return Ok(());
                }
                let item = required_item(OP, last_item)?;
                self.subtype = Subtype::Pagination {
                    last_item_id: item.public_id.clone(),
                    last_item_create_time: required_time(OP, item.create_time, "create")?,
                };
            }
            Subtype::StartRefresh { previous_phase_upper_bound, .. } => {
                if complete_listing {
                    self.subtype = Subtype::StartRefresh {
                        previous_phase_upper_bound: list_time,
                        previous_deleted_ids_time: deleted_ids_time,
                    };
                    return Ok(());
                }
                let item = required_item(OP, last_item)?;
                self.subtype = Subtype::Refresh {
                    phase_upper_bound: list_time,
                    phase_lower_bound: *previous_phase_upper_bound,
                    previous_deleted_ids_time: deleted_ids_time,
                    last_item_id: item.public_id.clone(),
                    last_item_update_time: required_time(OP, item.update_time, "update")?,
                };
            }
            Subtype::Refresh { phase_upper_bound, phase_lower_bound, .. } => {
                if complete_listing {
                    self.subtype = Subtype::StartRefresh {
                        previous_phase_upper_bound: *phase_upper_bound,
                        previous_deleted_ids_time: deleted_ids_time,
                    };
                    return Ok(());
                }
                let item = required_item(OP, last_item)?;
                self.subtype = Subtype::Refresh {
                    phase_upper_bound: *phase_upper_bound,
                    phase_lower_bound: *phase_lower_bound,
                    previous_deleted_ids_time: deleted_ids_time,
                    last_item_id: item.public_id.clone(),
                    last_item_update_time: required_time(OP, item.update_time, "update")?,
                };
            }
        }
        Ok(())
    }

    /// Validate the token against the caller's current request. Rejects
    /// expired tokens, grants-hash mismatches, kind mismatches and any
    /// subtype whose bounds fall outside `[create_time, now]`.
    pub fn validate(
        &self,
        expected_resource_kind: ResourceKind,
        expected_grants_hash: &[u8],
    ) -> Result<()> {
        const OP: &str = "listtoken.validate";
        let now = Utc::now();
        if self.grants_hash.is_empty() {
            return Err(Error::invalid_parameter(OP, "list token is missing its grants hash"));
        }
        if self.grants_hash != expected_grants_hash {
            return Err(Error::invalid_parameter(OP, "grants have changed since list token was issued"));
        }
        if self.create_time > now {
            return Err(Error::invalid_parameter(OP, "list token was created in the future"));
        }
        if self.create_time < now - Duration::days(LIST_TOKEN_TTL_DAYS) {
            return Err(Error::invalid_parameter(OP, "list token was expired"));
        }
        if self.resource_kind != expected_resource_kind {
            return Err(Error::invalid_parameter(
                OP,
                "list token resource kind does not match the expected resource kind",
            ));
        }
        match &self.subtype {
            Subtype::Pagination { last_item_id, last_item_create_time } => {
                if last_item_id.is_empty() {
                    return Err(Error::invalid_parameter(OP, "pagination token missing last item id"));
                }
                if *last_item_create_time > now {
                    return Err(Error::invalid_parameter(OP, "pagination token's last item was created in the future"));
                }
            }
            Subtype::StartRefresh { previous_phase_upper_bound, previous_deleted_ids_time } => {
                check_bound(OP, "previous phase upper bound", *previous_phase_upper_bound, self.create_time, now)?;
                check_bound(OP, "previous deleted ids time", *previous_deleted_ids_time, self.create_time, now)?;
            }
            Subtype::Refresh {
                phase_upper_bound,
                phase_lower_bound,
                previous_deleted_ids_time,
                last_item_id,
                last_item_update_time,
            } => {
                check_bound(OP, "phase upper bound", *phase_upper_bound, self.create_time, now)?;
                check_bound(OP, "phase lower bound", *phase_lower_bound, self.create_time, now)?;
                if phase_upper_bound < phase_lower_bound {
                    return Err(Error::invalid_parameter(OP, "refresh token's phase upper bound is before its phase lower bound"));
                }
                check_bound(OP, "previous deleted ids time", *previous_deleted_ids_time, self.create_time, now)?;
                if last_item_id.is_empty() {
                    return Err(Error::invalid_parameter(OP, "refresh token missing last item id"));
                }
                check_bound(OP, "last item update time", *last_item_update_time, self.create_time, now)?;
            }
        }
        Ok(())
    }

    /// Serialize the token to its opaque wire form: a single version byte
    /// followed by a JSON payload. Unknown fields in future payloads can be
    /// ignored by older readers.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        const OP: &str = "listtoken.to_bytes";
        let mut buf = vec![WIRE_VERSION];
        serde_json::to_writer(&mut buf, self).map_err(|e| Error::encoding(OP, e))?;
        Ok(buf)
    }

    /// Deserialize a token previously produced by [`ListToken::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        const OP: &str = "listtoken.from_bytes";
        let (version, payload) = bytes
            .split_first()
            .ok_or_else(|| Error::encoding(OP, "empty list token"))?;
        if *version != WIRE_VERSION {
            return Err(Error::encoding(OP, format!("unsupported list token version {version}")));
        }
        serde_json::from_slice(payload).map_err(|e| Error::encoding(OP, e))
    }
}

fn validate_common(op: &'static str, create_time: DateTime<Utc>, grants_hash: &[u8]) -> Result<()> {
    if grants_hash.is_empty() {
        return Err(Error::invalid_parameter(op, "missing grants hash"));
    }
    if create_time > Utc::now() {
        return Err(Error::invalid_parameter(op, "create time is in the future"));
    }
    if create_time < Utc::now() - Duration::days(LIST_TOKEN_TTL_DAYS) {
        return Err(Error::invalid_parameter(op, "create time is too old"));
    }
    Ok(())
}

fn required_item<'a>(op: &'static str, item: Option<&'a Item>) -> Result<&'a Item> {
    item.ok_or_else(|| Error::internal(op, "incomplete listing without a last item"))
}

fn required_time(op: &'static str, t: Option<DateTime<Utc>>, which: &str) -> Result<DateTime<Utc>> {
    t.ok_or_else(|| Error::internal(op, format!("last item is missing its {which} time")))
}

fn check_bound(
    op: &'static str,
    name: &str,
    value: DateTime<Utc>,
    create_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    if value < create_time {
        return Err(Error::invalid_parameter(op, format!("list token's {name} is before its create time")));
    }
    if value > now {
        return Err(Error::invalid_parameter(op, format!("list token's {name} is in the future")));
    }
    Ok(())
}

mod grants_hash_serde {
    //! Grants hashes travel as base64 so the JSON payload stays compact.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
