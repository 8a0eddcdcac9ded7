//! Racing Resolver
//!
//! Answers a request by racing every eligible backend and keeping the first
//! valid answer.
//!
//! ## Race layout
//!
//! ```text
//! t=0            local daemon (if any) starts
//! t=head_start   public candidates released (earlier if local fails)
//!                  Parallel:  all at once
//!                  Staggered: one per stagger_delay, a failure releases the next
//! first success  scope cancelled, remaining tasks aborted
//! ```
//!
//! Every candidate runs as a task in one `JoinSet` under a child of the
//! caller's cancellation token. Dropping the race (success, error, caller
//! cancellation or deadline) aborts whatever is still in flight.
//!
//! Per-candidate failures never surface. They become health signals and only
//! exhaustion is reported as [`StrandError::NotResolvable`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::ResourceKind;
use crate::clock::Clock;
use crate::config::ResolverConfig;
use crate::error::{Result, StrandError};
use crate::health::HealthRegistry;
use crate::ids::{ContentAddress, Identifier};
use crate::store::{KvStore, KvStoreExt};
use crate::transport::gateway::{GatewayClient, GatewayRequest, GatewayResponse};

const NAMES_NAMESPACE: &str = "names";

/// Source label of answers that did not touch the network
const DIRECT_SOURCE: &str = "direct";
const CACHE_SOURCE: &str = "cache";

// =============================================================================
// Types
// =============================================================================

/// The privileged local backend as seen by the resolver
#[async_trait]
pub trait LocalBackend: Send + Sync {
    /// Origin used in logs and answer attribution
    fn origin(&self) -> String;

    async fn resolve_name(&self, name: &str, timeout: Duration) -> Result<ContentAddress>;

    async fn fetch(&self, address: &ContentAddress, timeout: Duration) -> Result<Bytes>;
}

/// How public candidates are released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// All candidates at once
    Parallel,
    /// One candidate per stagger delay; a failure releases the next at once
    Staggered,
}

impl Strategy {
    fn default_for(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Content => Strategy::Parallel,
            ResourceKind::Name => Strategy::Staggered,
        }
    }
}

/// Per-call options
#[derive(Clone, Default)]
pub struct ResolveOptions {
    /// Local daemon for this call, if the session has one
    pub local: Option<Arc<dyn LocalBackend>>,
    /// Caller cancellation; propagates to every candidate
    pub cancel: Option<CancellationToken>,
    /// Overall deadline for the whole race
    pub deadline: Option<Duration>,
    /// Overrides the per-kind default strategy
    pub strategy: Option<Strategy>,
}

impl ResolveOptions {
    pub fn with_local(mut self, local: Arc<dyn LocalBackend>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Address(ContentAddress),
    Content(Bytes),
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub answer: Answer,
    /// Origin that won the race, or `direct` / `cache`
    pub source: String,
    /// Served from the persisted name cache after the network failed
    pub stale: bool,
    pub elapsed: Duration,
}

impl Resolved {
    pub fn address(&self) -> Option<&ContentAddress> {
        match &self.answer {
            Answer::Address(address) => Some(address),
            Answer::Content(_) => None,
        }
    }

    pub fn into_content(self) -> Option<Bytes> {
        match self.answer {
            Answer::Content(bytes) => Some(bytes),
            Answer::Address(_) => None,
        }
    }
}

/// Persisted last-known answer for a name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameCacheEntry {
    pub address: ContentAddress,
    pub resolved_at: i64,
}

#[derive(Debug, Default)]
struct ResolverStatsInner {
    races: AtomicU64,
    local_wins: AtomicU64,
    public_wins: AtomicU64,
    exhausted: AtomicU64,
    stale_answers: AtomicU64,
    content_cache_hits: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStats {
    pub races: u64,
    pub local_wins: u64,
    pub public_wins: u64,
    pub exhausted: u64,
    pub stale_answers: u64,
    pub content_cache_hits: u64,
}

#[derive(Debug, Clone)]
struct Candidate {
    origin: String,
    /// Request URL for public candidates
    url: Option<String>,
}

impl Candidate {
    fn is_local(&self) -> bool {
        self.url.is_none()
    }
}

type Outcome = (Candidate, Result<Answer>);

// =============================================================================
// Resolver
// =============================================================================

pub struct RacingResolver {
    health: Arc<HealthRegistry>,
    gateway: Arc<dyn GatewayClient>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: ResolverConfig,
    /// Immutable bytes by address
    content_cache: DashMap<ContentAddress, Bytes>,
    stats: ResolverStatsInner,
}

impl RacingResolver {
    pub fn new(
        health: Arc<HealthRegistry>,
        gateway: Arc<dyn GatewayClient>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            health,
            gateway,
            store,
            clock,
            config,
            content_cache: DashMap::new(),
            stats: ResolverStatsInner::default(),
        }
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Race every eligible backend for `identifier`
    pub async fn resolve(
        &self,
        identifier: &Identifier,
        kind: ResourceKind,
        opts: &ResolveOptions,
    ) -> Result<Resolved> {
        let started = Instant::now();

        match (identifier, kind) {
            (Identifier::Address(address), ResourceKind::Name) => {
                return Ok(Resolved {
                    answer: Answer::Address(address.clone()),
                    source: DIRECT_SOURCE.to_string(),
                    stale: false,
                    elapsed: started.elapsed(),
                });
            }
            (Identifier::Name(name), ResourceKind::Content) => {
                return Err(StrandError::InvalidIdentifier(format!(
                    "content fetch needs an address, got name {}",
                    name
                )));
            }
            _ => {}
        }

        self.stats.races.fetch_add(1, Ordering::Relaxed);
        let strategy = opts.strategy.unwrap_or_else(|| Strategy::default_for(kind));

        let mut pending: VecDeque<Candidate> = self
            .health
            .ranked_backends(kind)
            .into_iter()
            .filter_map(|backend| {
                let url = backend.url_for(identifier)?;
                Some(Candidate {
                    origin: backend.origin,
                    url: Some(url),
                })
            })
            .collect();

        // Child scope: cancelled on any exit, never cancels the caller
        let scope = opts
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let _scope_guard = scope.clone().drop_guard();
        let mut tasks: JoinSet<Outcome> = JoinSet::new();

        let mut release_at = started;
        if let Some(local) = &opts.local {
            self.spawn_local(&mut tasks, &scope, local.clone(), identifier, kind);
            release_at = started + self.config.local_head_start();
        }
        let mut next_launch = (!pending.is_empty()).then_some(release_at);

        let deadline = opts.deadline.map(|d| started + d);
        // Placeholder for disabled timer branches; never polled
        let idle = started + Duration::from_secs(86_400);

        debug!(
            identifier = %identifier,
            kind = %kind,
            candidates = pending.len(),
            local = opts.local.is_some(),
            ?strategy,
            "Starting race"
        );

        loop {
            if tasks.is_empty() && next_launch.is_none() {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(identifier = %identifier, kind = %kind, "No backend could answer");
                return Err(StrandError::NotResolvable(identifier.to_string()));
            }

            tokio::select! {
                biased;

                _ = scope.cancelled() => {
                    debug!(identifier = %identifier, "Race cancelled by caller");
                    return Err(StrandError::Cancelled);
                }

                _ = sleep_until(deadline.unwrap_or(idle)), if deadline.is_some() => {
                    warn!(identifier = %identifier, kind = %kind, "Race deadline elapsed");
                    return Err(StrandError::Timeout(identifier.to_string()));
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (candidate, result) = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(error = %e, "Race candidate task failed");
                            continue;
                        }
                    };

                    match result {
                        Ok(answer) => {
                            return Ok(self.on_success(identifier, kind, candidate, answer, started));
                        }
                        Err(e) => {
                            self.on_failure(kind, &candidate, &e);
                            let now = Instant::now();
                            if candidate.is_local() {
                                // Public candidates no longer wait for the head start
                                if next_launch.is_some_and(|at| at > now) {
                                    next_launch = Some(now);
                                }
                            } else if strategy == Strategy::Staggered && !pending.is_empty() {
                                next_launch = Some(now);
                            }
                        }
                    }
                }

                _ = sleep_until(next_launch.unwrap_or(idle)), if next_launch.is_some() => {
                    match strategy {
                        Strategy::Parallel => {
                            while let Some(candidate) = pending.pop_front() {
                                self.spawn_public(&mut tasks, &scope, candidate, kind);
                            }
                        }
                        Strategy::Staggered => {
                            if let Some(candidate) = pending.pop_front() {
                                self.spawn_public(&mut tasks, &scope, candidate, kind);
                            }
                        }
                    }
                    next_launch = (!pending.is_empty())
                        .then(|| Instant::now() + self.config.stagger_delay());
                }
            }
        }
    }

    fn on_success(
        &self,
        identifier: &Identifier,
        kind: ResourceKind,
        candidate: Candidate,
        answer: Answer,
        started: Instant,
    ) -> Resolved {
        if candidate.is_local() {
            self.stats.local_wins.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.public_wins.fetch_add(1, Ordering::Relaxed);
            self.health.promote(&candidate.origin, kind);
        }

        let elapsed = started.elapsed();
        info!(
            identifier = %identifier,
            kind = %kind,
            source = %candidate.origin,
            elapsed_ms = elapsed.as_millis() as u64,
            "Race won"
        );

        Resolved {
            answer,
            source: candidate.origin,
            stale: false,
            elapsed,
        }
    }

    fn on_failure(&self, kind: ResourceKind, candidate: &Candidate, error: &StrandError) {
        debug!(origin = %candidate.origin, error = %error, "Candidate failed");
        let Some(url) = &candidate.url else {
            return;
        };
        if matches!(error, StrandError::Cancelled) {
            return;
        }
        if error.is_backend_overload() {
            self.health.report_failure(url);
        } else {
            self.health.demote(&candidate.origin, kind);
        }
    }

    fn spawn_local(
        &self,
        tasks: &mut JoinSet<Outcome>,
        scope: &CancellationToken,
        local: Arc<dyn LocalBackend>,
        identifier: &Identifier,
        kind: ResourceKind,
    ) {
        let candidate = Candidate {
            origin: local.origin(),
            url: None,
        };
        let identifier = identifier.clone();
        let token = scope.clone();
        let timeout = match kind {
            ResourceKind::Name => self.config.local_name_timeout(),
            ResourceKind::Content => self.config.content_timeout(),
        };

        tasks.spawn(async move {
            let work = async {
                match &identifier {
                    Identifier::Name(name) => local
                        .resolve_name(name, timeout)
                        .await
                        .map(Answer::Address),
                    Identifier::Address(address) => {
                        local.fetch(address, timeout).await.map(Answer::Content)
                    }
                }
            };
            let result = tokio::select! {
                _ = token.cancelled() => Err(StrandError::Cancelled),
                r = tokio::time::timeout(timeout, work) => r.unwrap_or_else(|_| {
                    Err(StrandError::Timeout(candidate.origin.clone()))
                }),
            };
            (candidate, result)
        });
    }

    fn spawn_public(
        &self,
        tasks: &mut JoinSet<Outcome>,
        scope: &CancellationToken,
        candidate: Candidate,
        kind: ResourceKind,
    ) {
        let gateway = self.gateway.clone();
        let token = scope.clone();
        let timeout = match kind {
            ResourceKind::Name => self.config.name_timeout(),
            ResourceKind::Content => self.config.content_timeout(),
        };

        tasks.spawn(async move {
            let url = candidate.url.clone().unwrap_or_default();
            let result = tokio::select! {
                _ = token.cancelled() => Err(StrandError::Cancelled),
                r = tokio::time::timeout(timeout, query_public(gateway.as_ref(), &url, kind, timeout)) => {
                    r.unwrap_or_else(|_| Err(StrandError::Timeout(url.clone())))
                }
            };
            (candidate, result)
        });
    }

    // =========================================================================
    // Cached reads
    // =========================================================================

    /// Resolve a name, falling back to the last persisted answer.
    ///
    /// A stale answer is flagged in [`Resolved::stale`]. Cancellation is never
    /// masked by the cache.
    pub async fn resolve_name_cached(&self, name: &str, opts: &ResolveOptions) -> Result<Resolved> {
        let identifier = Identifier::Name(name.to_string());
        let started = Instant::now();

        match self.resolve(&identifier, ResourceKind::Name, opts).await {
            Ok(resolved) => {
                if let Some(address) = resolved.address() {
                    self.remember_name(name, address);
                }
                Ok(resolved)
            }
            Err(e @ (StrandError::NotResolvable(_) | StrandError::Timeout(_))) => {
                match self.cached_name(name) {
                    Some(entry) => {
                        self.stats.stale_answers.fetch_add(1, Ordering::Relaxed);
                        info!(
                            name = %name,
                            address = %entry.address,
                            resolved_at = entry.resolved_at,
                            "Serving stale name answer"
                        );
                        Ok(Resolved {
                            answer: Answer::Address(entry.address),
                            source: CACHE_SOURCE.to_string(),
                            stale: true,
                            elapsed: started.elapsed(),
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Last persisted answer for `name`
    pub fn cached_name(&self, name: &str) -> Option<NameCacheEntry> {
        match self.store.get_json(NAMES_NAMESPACE, name) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(name = %name, error = %e, "Unreadable name cache entry");
                None
            }
        }
    }

    /// Persisted answer for `name` if it is younger than the freshness window
    pub fn fresh_name(&self, name: &str) -> Option<ContentAddress> {
        let entry = self.cached_name(name)?;
        let age = self.clock.now_ms() - entry.resolved_at;
        (age >= 0 && (age as u64) < self.config.name_fresh_ms).then_some(entry.address)
    }

    /// Record an answer learned outside a race (e.g. after publishing)
    pub fn remember_name(&self, name: &str, address: &ContentAddress) {
        let entry = NameCacheEntry {
            address: address.clone(),
            resolved_at: self.clock.now_ms(),
        };
        if let Err(e) = self.store.set_json(NAMES_NAMESPACE, name, &entry) {
            warn!(name = %name, error = %e, "Failed to persist name cache entry");
        }
    }

    /// Content already held in memory
    pub fn cached_content(&self, address: &ContentAddress) -> Option<Bytes> {
        self.content_cache.get(address).map(|bytes| bytes.value().clone())
    }

    /// Fetch immutable content, served from memory when already seen
    pub async fn fetch_content(&self, address: &ContentAddress, opts: &ResolveOptions) -> Result<Bytes> {
        if let Some(bytes) = self.content_cache.get(address) {
            self.stats.content_cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes.value().clone());
        }

        let resolved = self
            .resolve(&Identifier::Address(address.clone()), ResourceKind::Content, opts)
            .await?;
        let bytes = resolved
            .into_content()
            .ok_or_else(|| StrandError::NoAnswer(address.to_string()))?;

        self.prime_content(address, bytes.clone());
        Ok(bytes)
    }

    /// Seed the content cache with bytes known to hash to `address`
    pub fn prime_content(&self, address: &ContentAddress, bytes: Bytes) {
        if self.config.content_cache_entries == 0 {
            return;
        }
        if self.content_cache.len() >= self.config.content_cache_entries
            && !self.content_cache.contains_key(address)
        {
            let victim = self.content_cache.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.content_cache.remove(&victim);
            }
        }
        self.content_cache.insert(address.clone(), bytes);
    }

    /// Flush the content cache and the persisted name cache
    pub fn invalidate(&self) {
        self.content_cache.clear();
        match self.store.keys(NAMES_NAMESPACE) {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.store.delete(NAMES_NAMESPACE, &key) {
                        warn!(name = %key, error = %e, "Failed to drop name cache entry");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list name cache"),
        }
        info!("Resolver caches invalidated");
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            races: self.stats.races.load(Ordering::Relaxed),
            local_wins: self.stats.local_wins.load(Ordering::Relaxed),
            public_wins: self.stats.public_wins.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            stale_answers: self.stats.stale_answers.load(Ordering::Relaxed),
            content_cache_hits: self.stats.content_cache_hits.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Answer extraction
// =============================================================================

async fn query_public(
    gateway: &dyn GatewayClient,
    url: &str,
    kind: ResourceKind,
    timeout: Duration,
) -> Result<Answer> {
    match kind {
        ResourceKind::Name => {
            let response = gateway.request(GatewayRequest::head(url, timeout)).await?;
            if !matches!(response.status, 200 | 206 | 300..=399) {
                return Err(StrandError::NoAnswer(url.to_string()));
            }
            extract_address(&response)
                .map(Answer::Address)
                .ok_or_else(|| StrandError::NoAnswer(url.to_string()))
        }
        ResourceKind::Content => {
            let response = gateway.request(GatewayRequest::get(url, timeout)).await?;
            if !matches!(response.status, 200 | 206) || response.body.is_empty() {
                return Err(StrandError::NoAnswer(url.to_string()));
            }
            Ok(Answer::Content(response.body))
        }
    }
}

/// Content address a name response points at, first matching rule wins
pub(crate) fn extract_address(response: &GatewayResponse) -> Option<ContentAddress> {
    if let Some(roots) = response.header("x-ipfs-roots") {
        if let Some(address) = roots
            .split(',')
            .next()
            .and_then(|root| ContentAddress::parse(root.trim()).ok())
        {
            return Some(address);
        }
    }
    if let Some(address) = response.header("location").and_then(address_in_url) {
        return Some(address);
    }
    if let Some(address) = response
        .header("x-ipfs-path")
        .filter(|path| path.starts_with("/ipfs/"))
        .and_then(|path| ContentAddress::parse(path).ok())
    {
        return Some(address);
    }
    address_in_url(&response.final_url)
}

/// Address in a `/ipfs/<cid>` path or a `<cid>.ipfs.<host>` subdomain
fn address_in_url(raw: &str) -> Option<ContentAddress> {
    if let Some(index) = raw.find("/ipfs/") {
        let rest = &raw[index + "/ipfs/".len()..];
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        if let Ok(address) = ContentAddress::parse(&rest[..end]) {
            return Some(address);
        }
    }

    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let mut labels = host.split('.');
    let first = labels.next()?;
    if labels.next()? == "ipfs" {
        return ContentAddress::parse(first).ok();
    }
    None
}
