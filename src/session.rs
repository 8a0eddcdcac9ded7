//! Session provider and login reconciliation
//!
//! The provider is an external oracle: it is asked for the local daemon on
//! every operation and its answer is never kept beyond that operation.
//!
//! At login the network head (resolved name) and the optimistic head (saved
//! after our last successful publish) are both loaded. The one whose head
//! fragment carries the larger `updatedAt` becomes the starting state; a tie
//! goes to the network. Only timestamps are compared, so concurrent writers
//! on the same name can lose a branch.

use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, StrandError};
use crate::ids::ContentAddress;
use crate::publish::{load_optimistic_head, SessionState};
use crate::resolver::{RacingResolver, ResolveOptions};
use crate::state::StateAggregator;
use crate::store::KvStore;
use crate::transport::DaemonEndpoint;

/// Supplies per-operation session facts
pub trait SessionProvider: Send + Sync {
    /// The local daemon, if one is configured right now
    fn local_daemon(&self) -> Option<DaemonEndpoint>;
}

/// Provider holding a replaceable daemon endpoint
#[derive(Debug, Default)]
pub struct StaticSession {
    daemon: RwLock<Option<DaemonEndpoint>>,
}

impl StaticSession {
    pub fn new(daemon: Option<DaemonEndpoint>) -> Self {
        Self {
            daemon: RwLock::new(daemon),
        }
    }

    pub fn set_daemon(&self, daemon: Option<DaemonEndpoint>) {
        let mut guard = self.daemon.write().unwrap_or_else(|p| p.into_inner());
        *guard = daemon;
    }
}

impl SessionProvider for StaticSession {
    fn local_daemon(&self) -> Option<DaemonEndpoint> {
        self.daemon.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Which side won reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource {
    Network,
    Optimistic,
    /// Neither head could be loaded
    Fresh,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub state: SessionState,
    pub source: ReconcileSource,
}

/// Pick the starting state for `name`.
///
/// A fresh state is only chosen when the name is unknown to every backend
/// and no optimistic head was saved. A head that is known but unreadable
/// fails the login: starting over on top of it would orphan its chain.
pub async fn reconcile(
    name: &str,
    name_hint: Option<&str>,
    resolver: &RacingResolver,
    aggregator: &StateAggregator,
    store: &dyn KvStore,
    opts: &ResolveOptions,
) -> Result<Reconciled> {
    let (network_head, lookup_error) = match resolver.resolve_name_cached(name, opts).await {
        Ok(resolved) => (resolved.address().cloned(), None),
        Err(StrandError::Cancelled) => return Err(StrandError::Cancelled),
        Err(StrandError::NotResolvable(_)) => {
            debug!(name = %name, "Name not published yet");
            (None, None)
        }
        Err(e) => {
            warn!(name = %name, error = %e, "Name lookup failed at login");
            (None, Some(e))
        }
    };
    let optimistic_head = load_optimistic_head(store, name).map(|record| record.address);

    let network = match &network_head {
        Some(address) => Some(load(address, name_hint, aggregator).await),
        None => None,
    };
    let optimistic = match &optimistic_head {
        Some(address) if Some(address) == network_head.as_ref() => None,
        Some(address) => Some(load(address, name_hint, aggregator).await),
        None => None,
    };
    for loaded in [&network, &optimistic].into_iter().flatten() {
        if let Err(StrandError::Cancelled) = loaded {
            return Err(StrandError::Cancelled);
        }
    }

    let (state, source) = match (network, optimistic) {
        (Some(Ok(net)), Some(Ok(opt))) if opt.logical.updated_at > net.logical.updated_at => {
            info!(
                name = %name,
                optimistic = %opt.head_address,
                network = %net.head_address,
                "Optimistic head is newer than the network"
            );
            (opt, ReconcileSource::Optimistic)
        }
        (Some(Ok(net)), opt) => {
            if let Some(Err(e)) = opt {
                warn!(name = %name, error = %e, "Optimistic head unreadable, using the network");
            }
            (net, ReconcileSource::Network)
        }
        (Some(Err(e)), _) => return Err(e),
        (None, Some(Ok(opt))) => (opt, ReconcileSource::Optimistic),
        (None, Some(Err(e))) => return Err(e),
        (None, None) => {
            if let Some(e) = lookup_error {
                return Err(e);
            }
            warn!(name = %name, "Nothing published under this name, starting from an empty state");
            (SessionState::fresh(name_hint), ReconcileSource::Fresh)
        }
    };

    debug!(
        name = %name,
        head = %state.head_address,
        truncated = state.truncated,
        ?source,
        "Session reconciled"
    );
    Ok(Reconciled { state, source })
}

/// Committed state rooted at `head`
async fn load(
    head: &ContentAddress,
    name_hint: Option<&str>,
    aggregator: &StateAggregator,
) -> Result<SessionState> {
    if head.is_empty_sentinel() {
        return Ok(SessionState::fresh(name_hint));
    }

    let fragment = aggregator
        .source()
        .fetch_fragment(head)
        .await
        .map_err(|e| match e {
            StrandError::Cancelled => StrandError::Cancelled,
            other => {
                warn!(head = %head, error = %other, "Head unreadable during reconciliation");
                StrandError::HeadUnreadable {
                    address: head.to_string(),
                    reason: other.to_string(),
                }
            }
        })?;
    let chain = aggregator.walk(head, name_hint).await?;

    Ok(SessionState {
        logical: chain.state,
        head: fragment,
        head_address: head.clone(),
        truncated: chain.truncated,
    })
}
