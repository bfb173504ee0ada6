//! Per-project badge token cache with single-flight fetching.
//!
//! Every project key maps to either a `Ready` token or a `Pending` marker for a
//! fetch that is in flight. The marker is written atomically through the cache
//! entry API, so at most one caller becomes the fetcher for a key. Everybody
//! else arriving while the marker is live subscribes to the fetcher's outcome
//! instead of hitting the upstream again.
//!
//! Both states carry their own deadline: `Ready` entries live for the configured
//! TTL and `Pending` markers for the short guard TTL, after which a waiter races
//! to become the new fetcher.

use crate::config::CacheConfig;
use crate::metrics_defs::{
    TOKEN_CACHE_COALESCED, TOKEN_CACHE_HIT, TOKEN_CACHE_MISS, TOKEN_FETCH_DURATION,
};
use async_trait::async_trait;
use moka::Expiry;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use shared::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Transport level failure while talking to the metrics server.
    #[error("{0}")]
    UpstreamUnavailable(String),
}

/// Source of fresh badge tokens, usually the upstream metrics server.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self, project: &str, credential: &str) -> Result<String, TokenError>;
}

type FetchOutcome = Result<String, TokenError>;

#[derive(Clone)]
enum TokenState {
    Pending {
        reservation: u64,
        outcome: watch::Receiver<Option<FetchOutcome>>,
    },
    Ready(String),
}

#[derive(Clone)]
struct CacheEntry {
    state: TokenState,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn is_reservation(&self, id: u64) -> bool {
        matches!(self.state, TokenState::Pending { reservation, .. } if reservation == id)
    }
}

/// Expires each entry at its own deadline.
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    /// Lifetime of a fetched token.
    pub ttl: Duration,
    /// Lifetime of a `Pending` marker. Zero disables fetch coalescing.
    pub pending_ttl: Duration,
    pub max_capacity: u64,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        CacheSettings {
            ttl: Duration::from_secs(config.ttl_secs),
            pending_ttl: Duration::from_millis(config.pending_ttl_ms),
            max_capacity: config.max_capacity,
        }
    }
}

enum Lookup {
    Ready(String),
    Pending {
        outcome: watch::Receiver<Option<FetchOutcome>>,
        expires_at: Instant,
    },
    Reserved(Reservation),
}

pub struct TokenCache {
    entries: Cache<String, CacheEntry>,
    source: Arc<dyn TokenSource>,
    settings: CacheSettings,
    next_reservation: AtomicU64,
}

impl TokenCache {
    pub fn new(settings: CacheSettings, source: Arc<dyn TokenSource>) -> Self {
        let entries = Cache::builder()
            .max_capacity(settings.max_capacity)
            .expire_after(EntryExpiry)
            .build();

        TokenCache {
            entries,
            source,
            settings,
            next_reservation: AtomicU64::new(1),
        }
    }

    /// Returns a badge token for `project`, fetching it with `credential` when
    /// no live token is cached. Concurrent callers for the same project share a
    /// single upstream fetch and all observe its outcome.
    pub async fn get_or_fetch(&self, project: &str, credential: &str) -> Result<String, TokenError> {
        loop {
            match self.lookup(project) {
                Lookup::Ready(token) => {
                    tracing::debug!(project, "Token found in cache");
                    counter!(TOKEN_CACHE_HIT).increment(1);
                    return Ok(token);
                }
                Lookup::Pending {
                    mut outcome,
                    expires_at,
                } => {
                    tracing::debug!(project, "Waiting for the token being issued");
                    counter!(TOKEN_CACHE_COALESCED).increment(1);

                    let deadline = tokio::time::Instant::from_std(expires_at);
                    let resolved = match tokio::time::timeout_at(
                        deadline,
                        outcome.wait_for(Option::is_some),
                    )
                    .await
                    {
                        Ok(Ok(value)) => (*value).clone(),
                        _ => None,
                    };
                    if let Some(result) = resolved {
                        return result;
                    }
                    // The fetcher went away or the marker ran out; race for a new reservation.
                }
                Lookup::Reserved(reservation) => {
                    counter!(TOKEN_CACHE_MISS).increment(1);
                    return self.fetch(project, credential, reservation).await;
                }
            }
        }
    }

    /// Reads the entry for `project`, reserving it for the caller if nothing
    /// live is stored.
    fn lookup(&self, project: &str) -> Lookup {
        let now = Instant::now();
        let id = self.next_reservation.fetch_add(1, Ordering::Relaxed);

        if self.settings.pending_ttl.is_zero() {
            return match self.entries.get(project) {
                Some(CacheEntry {
                    state: TokenState::Ready(token),
                    expires_at,
                }) if expires_at > now => Lookup::Ready(token),
                _ => Lookup::Reserved(Reservation::unguarded(self.entries.clone(), project, id)),
            };
        }

        let (sender, receiver) = watch::channel(None);
        let marker = CacheEntry {
            state: TokenState::Pending {
                reservation: id,
                outcome: receiver,
            },
            expires_at: now + self.settings.pending_ttl,
        };

        let result = self
            .entries
            .entry_by_ref(project)
            .and_compute_with(|current| match current {
                Some(entry) if entry.value().is_live(now) => Op::Nop,
                _ => Op::Put(marker),
            });

        match result {
            CompResult::Unchanged(entry) => {
                let entry = entry.into_value();
                match entry.state {
                    TokenState::Ready(token) => Lookup::Ready(token),
                    TokenState::Pending { outcome, .. } => Lookup::Pending {
                        outcome,
                        expires_at: entry.expires_at,
                    },
                }
            }
            CompResult::Inserted(_) | CompResult::ReplacedWith(_) => {
                Lookup::Reserved(Reservation::new(self.entries.clone(), project, id, sender))
            }
            CompResult::StillNone(_) | CompResult::Removed(_) => {
                Lookup::Reserved(Reservation::unguarded(self.entries.clone(), project, id))
            }
        }
    }

    async fn fetch(
        &self,
        project: &str,
        credential: &str,
        reservation: Reservation,
    ) -> Result<String, TokenError> {
        tracing::debug!(project, "Get project token from upstream");
        let started = Instant::now();
        let result = self.source.fetch_token(project, credential).await;
        histogram!(TOKEN_FETCH_DURATION).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(token) if !token.is_empty() => {
                self.entries.insert(
                    project.to_string(),
                    CacheEntry {
                        state: TokenState::Ready(token.clone()),
                        expires_at: Instant::now() + self.settings.ttl,
                    },
                );
            }
            // Empty tokens come from unparseable payloads and are never worth keeping.
            Ok(_) => reservation.release(),
            Err(e) => {
                tracing::warn!(project, error = %e, "Error while getting badge token");
                reservation.release();
            }
        }

        reservation.resolve(result.clone());
        result
    }

    #[cfg(test)]
    fn is_pending(&self, project: &str) -> bool {
        self.entries.get(project).is_some_and(|entry| {
            entry.is_live(Instant::now()) && matches!(entry.state, TokenState::Pending { .. })
        })
    }
}

/// Ownership of a `Pending` marker. Dropping it without resolving removes the
/// marker, so waiters retry right away when the fetching request is cancelled.
struct Reservation {
    entries: Cache<String, CacheEntry>,
    project: String,
    id: u64,
    outcome: Option<watch::Sender<Option<FetchOutcome>>>,
}

impl Reservation {
    fn new(
        entries: Cache<String, CacheEntry>,
        project: &str,
        id: u64,
        outcome: watch::Sender<Option<FetchOutcome>>,
    ) -> Self {
        Reservation {
            entries,
            project: project.to_string(),
            id,
            outcome: Some(outcome),
        }
    }

    fn unguarded(entries: Cache<String, CacheEntry>, project: &str, id: u64) -> Self {
        Reservation {
            entries,
            project: project.to_string(),
            id,
            outcome: None,
        }
    }

    /// Removes the marker if it is still ours.
    fn release(&self) {
        let id = self.id;
        self.entries
            .entry_by_ref(self.project.as_str())
            .and_compute_with(|current| match current {
                Some(entry) if entry.value().is_reservation(id) => Op::Remove,
                _ => Op::Nop,
            });
    }

    fn resolve(mut self, result: FetchOutcome) {
        if let Some(outcome) = self.outcome.take() {
            outcome.send_replace(Some(result));
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.outcome.is_some() {
            self.release();
        }
    }
}
