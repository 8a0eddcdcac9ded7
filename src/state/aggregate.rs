//! State Aggregator
//!
//! Walks a `next`-linked chain of fragments from the head and flattens it
//! into one logical [`UserState`].
//!
//! - Head `profile` and `updatedAt` are kept verbatim
//! - List fields are concatenated head first, then deduplicated keeping the
//!   head-most occurrence
//! - A head that cannot be fetched fails the call; any later failure
//!   truncates the chain and is reported in [`Chain::truncated`]
//! - Cancellation always fails the call, wherever the walk is
//! - The empty sentinel as head answers without touching the network

use async_trait::async_trait;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backoff::BackoffGovernor;
use crate::config::AggregatorConfig;
use crate::error::{Result, StrandError};
use crate::ids::ContentAddress;
use crate::resolver::{RacingResolver, ResolveOptions};

use super::model::UserState;

/// Fetches and parses one fragment
#[async_trait]
pub trait FragmentSource: Send + Sync {
    async fn fetch_fragment(&self, address: &ContentAddress) -> Result<UserState>;
}

/// Outcome of one chain walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub state: UserState,
    /// The walk stopped before the tail: a fragment past the head was
    /// unreadable or the chunk ceiling was reached
    pub truncated: bool,
}

pub struct StateAggregator {
    source: Arc<dyn FragmentSource>,
    config: AggregatorConfig,
}

impl StateAggregator {
    pub fn new(source: Arc<dyn FragmentSource>, config: AggregatorConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &Arc<dyn FragmentSource> {
        &self.source
    }

    /// Reconstruct the logical state whose newest fragment is `head`
    pub async fn aggregate(&self, head: &ContentAddress, name_hint: Option<&str>) -> Result<UserState> {
        Ok(self.walk(head, name_hint).await?.state)
    }

    /// [`aggregate`](Self::aggregate), also reporting whether the chain was
    /// read to its end
    pub async fn walk(&self, head: &ContentAddress, name_hint: Option<&str>) -> Result<Chain> {
        if head.is_empty_sentinel() {
            debug!(name = ?name_hint, "Head is the empty sentinel");
            return Ok(Chain {
                state: UserState::empty(name_hint),
                truncated: false,
            });
        }

        let mut fragments = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(head.clone());
        let mut truncated = false;

        while let Some(address) = current.take() {
            if address.is_empty_sentinel() {
                break;
            }
            if fragments.len() >= self.config.max_chunks {
                warn!(
                    head = %head,
                    max_chunks = self.config.max_chunks,
                    "Chunk ceiling reached, chain truncated"
                );
                truncated = true;
                break;
            }
            if !visited.insert(address.clone()) {
                warn!(head = %head, address = %address, "Cycle in fragment chain");
                break;
            }

            match self.source.fetch_fragment(&address).await {
                Ok(fragment) => {
                    current = fragment.next.clone();
                    fragments.push(fragment);
                }
                Err(StrandError::Cancelled) => return Err(StrandError::Cancelled),
                Err(e) if fragments.is_empty() => {
                    return Err(StrandError::HeadUnreadable {
                        address: address.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        head = %head,
                        address = %address,
                        walked = fragments.len(),
                        error = %e,
                        "Fragment unreadable, chain truncated"
                    );
                    truncated = true;
                    break;
                }
            }
        }

        debug!(head = %head, fragments = fragments.len(), truncated, "Aggregated chain");
        Ok(Chain {
            state: merge(fragments),
            truncated,
        })
    }
}

/// Flatten fragments given head first
pub fn merge(fragments: impl IntoIterator<Item = UserState>) -> UserState {
    let mut merged = UserState::default();

    for (index, fragment) in fragments.into_iter().enumerate() {
        if index == 0 {
            merged.profile = fragment.profile;
            merged.updated_at = fragment.updated_at;
        }
        merged.post_refs.extend(fragment.post_refs);
        merged.follows.extend(fragment.follows);
        merged.liked_refs.extend(fragment.liked_refs);
        merged.disliked_refs.extend(fragment.disliked_refs);
    }

    dedup_by_key(&mut merged.follows, |f| f.address.clone());
    dedup_by_key(&mut merged.post_refs, |a| a.clone());
    dedup_by_key(&mut merged.liked_refs, |a| a.clone());
    dedup_by_key(&mut merged.disliked_refs, |a| a.clone());
    merged.next = None;
    merged
}

/// Drop later duplicates, keeping order of first occurrence
fn dedup_by_key<T, K, F>(items: &mut Vec<T>, key: F)
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(key(item)));
}

// =============================================================================
// Network-backed source
// =============================================================================

/// Poll interval while another task fetches the same fragment
const IN_FLIGHT_POLL: Duration = Duration::from_millis(50);

/// Fragments fetched through the racing resolver, gated by the backoff governor
pub struct ResolverFragmentSource {
    resolver: Arc<RacingResolver>,
    governor: Arc<BackoffGovernor>,
    opts: ResolveOptions,
}

impl ResolverFragmentSource {
    pub fn new(resolver: Arc<RacingResolver>, governor: Arc<BackoffGovernor>, opts: ResolveOptions) -> Self {
        Self {
            resolver,
            governor,
            opts,
        }
    }
}

#[async_trait]
impl FragmentSource for ResolverFragmentSource {
    async fn fetch_fragment(&self, address: &ContentAddress) -> Result<UserState> {
        let key = address.as_str();

        let attempt = loop {
            if let Some(bytes) = self.resolver.cached_content(address) {
                return Ok(serde_json::from_slice(&bytes)?);
            }
            if let Some(attempt) = self.governor.begin(key) {
                break attempt;
            }
            if self.governor.is_penalized(key) {
                return Err(StrandError::BackedOff(key.to_string()));
            }
            // Someone else is fetching it; the result lands in the content cache
            match &self.opts.cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => return Err(StrandError::Cancelled),
                    _ = tokio::time::sleep(IN_FLIGHT_POLL) => {}
                },
                None => tokio::time::sleep(IN_FLIGHT_POLL).await,
            }
        };

        // Dropping `attempt` unsettled (cancelled, or this future dropped)
        // releases the key without a penalty
        match self.resolver.fetch_content(address, &self.opts).await {
            Ok(bytes) => {
                attempt.succeeded();
                Ok(serde_json::from_slice(&bytes)?)
            }
            Err(StrandError::Cancelled) => Err(StrandError::Cancelled),
            Err(e) => {
                attempt.failed();
                Err(e)
            }
        }
    }
}
