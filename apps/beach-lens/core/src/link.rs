use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Lifetime of links minted for cast devices.
pub const EPHEMERAL_LINK_TTL_SECS: u64 = 30;

/// What a link grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTarget {
    /// A literal stream source (rtsp://, template, ...).
    Url(String),
    /// A camera entity whose stream source is looked up at redemption time.
    Entity(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub target: LinkTarget,
    /// `None` means unlimited.
    pub remaining_uses: Option<u32>,
    /// `None` means the link never expires.
    pub expires_at: Option<OffsetDateTime>,
}

impl LinkEntry {
    fn new(target: LinkTarget, max_uses: u32, ttl_seconds: u64, now: OffsetDateTime) -> Self {
        let remaining_uses = (max_uses > 0).then_some(max_uses);
        let expires_at = if ttl_seconds == 0 {
            None
        } else {
            let ttl = Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX));
            // A TTL too large to represent is treated as "never".
            now.checked_add(ttl)
        };
        Self {
            target,
            remaining_uses,
            expires_at,
        }
    }

    fn expired(&self, now: OffsetDateTime) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link {0} not found")]
    NotFound(String),
    #[error("link {0} has expired")]
    Gone(String),
}

impl LinkError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            LinkError::NotFound(_) => "not_found",
            LinkError::Gone(_) => "gone",
        }
    }
}

/// In-memory registry of link grants.
///
/// Expiry and use limits are enforced when a link is resolved; nothing sweeps
/// the map in the background. Each resolution holds the shard lock for its id,
/// so concurrent redemptions of a single-use link admit exactly one caller.
#[derive(Clone, Default)]
pub struct LinkStore {
    links: Arc<DashMap<String, LinkEntry>>,
}

impl LinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a link. `max_uses == 0` is unlimited and
    /// `ttl_seconds == 0` never expires.
    pub fn create(&self, id: impl Into<String>, target: LinkTarget, max_uses: u32, ttl_seconds: u64) {
        self.create_at(id, target, max_uses, ttl_seconds, OffsetDateTime::now_utc());
    }

    pub fn create_at(
        &self,
        id: impl Into<String>,
        target: LinkTarget,
        max_uses: u32,
        ttl_seconds: u64,
        now: OffsetDateTime,
    ) {
        let entry = LinkEntry::new(target, max_uses, ttl_seconds, now);
        self.links.insert(id.into(), entry);
    }

    /// Mints a single-use link that expires after [`EPHEMERAL_LINK_TTL_SECS`].
    pub fn create_ephemeral(&self, target: LinkTarget) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.create(id.clone(), target, 1, EPHEMERAL_LINK_TTL_SECS);
        id
    }

    /// Redeems one use of `id`.
    pub fn resolve(&self, id: &str) -> Result<LinkTarget, LinkError> {
        self.resolve_at(id, OffsetDateTime::now_utc())
    }

    pub fn resolve_at(&self, id: &str, now: OffsetDateTime) -> Result<LinkTarget, LinkError> {
        let Entry::Occupied(mut entry) = self.links.entry(id.to_string()) else {
            return Err(LinkError::NotFound(id.to_string()));
        };

        if entry.get().expired(now) {
            entry.remove();
            return Err(LinkError::Gone(id.to_string()));
        }

        let exhausted = match entry.get_mut().remaining_uses.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };

        if exhausted {
            Ok(entry.remove().target)
        } else {
            Ok(entry.get().target.clone())
        }
    }

    /// Returns a copy of the entry without consuming a use.
    pub fn peek(&self, id: &str) -> Option<LinkEntry> {
        self.links.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
