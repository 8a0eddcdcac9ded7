//! Engine facade
//!
//! Owns the shared components (store, health registry, backoff governor,
//! racing resolver) and builds the per-operation pieces from the session
//! provider: the local daemon client is created fresh for every call so a
//! daemon configured or removed mid-session is picked up immediately.

use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ResourceKind;
use crate::backoff::BackoffGovernor;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Result, StrandError};
use crate::health::{HealthRegistry, HealthSnapshot};
use crate::ids::{ContentAddress, Identifier};
use crate::publish::{ContentWriter, Mutation, PublishPipeline, WriteGate};
use crate::resolver::{LocalBackend, RacingResolver, ResolveOptions, Resolved, ResolverStats};
use crate::session::{reconcile, SessionProvider};
use crate::state::{Follow, Post, ResolverFragmentSource, StateAggregator, UserState};
use crate::store::{KvStore, MemoryStore, SledStore};
use crate::transport::{DaemonClient, GatewayClient, HttpGateway, RetryPolicy};

/// Latest known head of a followed user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowHead {
    pub follow: Follow,
    pub head: Option<ContentAddress>,
    /// Head differs from the follow's `last_seen_ref`
    pub changed: bool,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    health: Arc<HealthRegistry>,
    governor: Arc<BackoffGovernor>,
    resolver: Arc<RacingResolver>,
    session: Arc<dyn SessionProvider>,
    /// One queue for every heavy write against the local daemon
    write_gate: WriteGate,
    /// Connection pool shared by the per-operation daemon clients
    http: reqwest::Client,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KvStore>,
        gateway: Arc<dyn GatewayClient>,
        session: Arc<dyn SessionProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let health = Arc::new(HealthRegistry::new(
            store.clone(),
            config.gateways.clone(),
            config.health.clone(),
        ));
        let governor = Arc::new(BackoffGovernor::new(
            store.clone(),
            clock.clone(),
            config.backoff.clone(),
        ));
        let resolver = Arc::new(RacingResolver::new(
            health.clone(),
            gateway,
            store.clone(),
            clock.clone(),
            config.resolver.clone(),
        ));
        let http = reqwest::Client::builder()
            .user_agent(concat!("strand/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            store,
            clock,
            health,
            governor,
            resolver,
            session,
            write_gate: WriteGate::default(),
            http,
        })
    }

    /// Engine with the default stack: sled when a data dir is configured,
    /// the reqwest gateway client and the system clock
    pub fn open(config: EngineConfig, session: Arc<dyn SessionProvider>) -> Result<Self> {
        let store: Arc<dyn KvStore> = match &config.engine.data_dir {
            Some(dir) => {
                info!(path = %dir.display(), "Opening persistent store");
                Arc::new(SledStore::open(dir.join("strand.db"))?)
            }
            None => {
                info!("No data directory configured, state is kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        let gateway = Arc::new(HttpGateway::new()?);
        Self::new(config, store, gateway, session, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<RacingResolver> {
        &self.resolver
    }

    pub fn governor(&self) -> &Arc<BackoffGovernor> {
        &self.governor
    }

    /// Client for the daemon the session currently reports
    fn daemon(&self) -> Option<DaemonClient> {
        let endpoint = self.session.local_daemon()?;
        Some(DaemonClient::with_client(
            self.http.clone(),
            endpoint,
            RetryPolicy::from_config(&self.config.daemon),
        ))
    }

    /// Options for one operation, with the current local daemon if any
    pub fn resolve_options(&self, cancel: Option<CancellationToken>) -> ResolveOptions {
        let mut opts = ResolveOptions::default();
        if let Some(daemon) = self.daemon() {
            opts = opts.with_local(Arc::new(daemon) as Arc<dyn LocalBackend>);
        }
        if let Some(cancel) = cancel {
            opts = opts.with_cancel(cancel);
        }
        opts
    }

    /// Write side of the local daemon; writes need one
    pub fn writer(&self) -> Result<Arc<dyn ContentWriter>> {
        self.daemon()
            .map(|daemon| Arc::new(daemon) as Arc<dyn ContentWriter>)
            .ok_or(StrandError::NoLocalDaemon)
    }

    /// Reachability probe of the local daemon, returning its peer id
    pub async fn daemon_identity(&self) -> Result<String> {
        let daemon = self.daemon().ok_or(StrandError::NoLocalDaemon)?;
        daemon.id(self.config.daemon.request_timeout()).await
    }

    pub async fn resolve(
        &self,
        identifier: &Identifier,
        kind: ResourceKind,
        cancel: Option<CancellationToken>,
    ) -> Result<Resolved> {
        self.resolver
            .resolve(identifier, kind, &self.resolve_options(cancel))
            .await
    }

    /// Resolve a name, falling back to the last known answer
    pub async fn resolve_name(&self, name: &str, cancel: Option<CancellationToken>) -> Result<Resolved> {
        self.resolver
            .resolve_name_cached(name, &self.resolve_options(cancel))
            .await
    }

    pub async fn fetch_content(
        &self,
        address: &ContentAddress,
        cancel: Option<CancellationToken>,
    ) -> Result<Bytes> {
        self.resolver
            .fetch_content(address, &self.resolve_options(cancel))
            .await
    }

    pub async fn fetch_post(&self, address: &ContentAddress, cancel: Option<CancellationToken>) -> Result<Post> {
        let bytes = self.fetch_content(address, cancel).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Aggregator reading fragments through the resolver and governor
    pub fn aggregator(&self, opts: ResolveOptions) -> StateAggregator {
        let source = ResolverFragmentSource::new(self.resolver.clone(), self.governor.clone(), opts);
        StateAggregator::new(Arc::new(source), self.config.aggregator.clone())
    }

    /// Logical state of any user, by name
    pub async fn load_user(
        &self,
        name: &str,
        name_hint: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> Result<UserState> {
        let opts = self.resolve_options(cancel);
        let resolved = self.resolver.resolve_name_cached(name, &opts).await?;
        let head = resolved
            .address()
            .cloned()
            .ok_or_else(|| StrandError::NoAnswer(name.to_string()))?;
        self.aggregator(opts).aggregate(&head, name_hint).await
    }

    /// Best known head of a followed user.
    ///
    /// A fresh cached answer skips the network. Otherwise the lookup is
    /// gated per name by the governor; a skipped or failed lookup falls back
    /// to the follow's cursor, then to the last cached answer.
    pub async fn follow_head(&self, follow: &Follow, opts: &ResolveOptions) -> Option<ContentAddress> {
        if let Some(address) = self.resolver.fresh_name(&follow.address) {
            return Some(address);
        }

        let key = follow.address.as_str();
        if let Some(attempt) = self.governor.begin(key) {
            match self.resolver.resolve_name_cached(key, opts).await {
                Ok(resolved) if !resolved.stale => {
                    attempt.succeeded();
                    return resolved.address().cloned();
                }
                Ok(resolved) => {
                    attempt.failed();
                    return resolved.address().cloned();
                }
                // Released unjudged when dropped
                Err(StrandError::Cancelled) => {}
                Err(e) => {
                    debug!(name = %key, error = %e, "Follow head not resolvable");
                    attempt.failed();
                }
            }
        } else {
            debug!(name = %key, "Follow lookup skipped by backoff");
        }

        follow
            .last_seen_ref
            .clone()
            .or_else(|| self.resolver.cached_name(key).map(|entry| entry.address))
    }

    /// Heads of every follow, looked up concurrently
    pub async fn follow_heads(&self, follows: &[Follow], cancel: Option<CancellationToken>) -> Vec<FollowHead> {
        let opts = self.resolve_options(cancel);
        let lookups = follows.iter().map(|follow| {
            let opts = &opts;
            async move {
                let head = self.follow_head(follow, opts).await;
                let changed = head.is_some() && head != follow.last_seen_ref;
                FollowHead {
                    follow: follow.clone(),
                    head,
                    changed,
                }
            }
        });
        join_all(lookups).await
    }

    /// Reconcile the network and optimistic heads and open a publish session
    pub async fn login(
        &self,
        name: &str,
        name_hint: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> Result<PublishPipeline> {
        let opts = self.resolve_options(cancel);
        let aggregator = self.aggregator(opts.clone());
        let reconciled = reconcile(
            name,
            name_hint,
            &self.resolver,
            &aggregator,
            self.store.as_ref(),
            &opts,
        )
        .await?;

        info!(
            name = %name,
            head = %reconciled.state.head_address,
            source = ?reconciled.source,
            "Logged in"
        );
        Ok(PublishPipeline::new(
            name,
            reconciled.state,
            self.store.clone(),
            self.clock.clone(),
            self.config.publish.clone(),
        )
        .with_write_gate(self.write_gate.clone()))
    }

    /// Apply one mutation through the session's pipeline
    pub async fn apply(
        &self,
        pipeline: &PublishPipeline,
        mutation: Mutation,
        cancel: Option<CancellationToken>,
    ) -> Result<ContentAddress> {
        let writer = self.writer()?;
        if mutation.is_removal() {
            self.complete_chain(pipeline, cancel.clone()).await?;
        }
        let head = pipeline.apply(mutation, writer, cancel).await?;
        self.after_publish(pipeline);
        Ok(head)
    }

    /// Upload a post and add it to the session's state; returns the post address
    pub async fn publish_post(
        &self,
        pipeline: &PublishPipeline,
        post: &Post,
        cancel: Option<CancellationToken>,
    ) -> Result<ContentAddress> {
        let writer = self.writer()?;
        let post_ref = pipeline.publish_post(post, writer, cancel).await?;
        self.after_publish(pipeline);
        Ok(post_ref)
    }

    /// Re-walk the committed chain if login only read part of it.
    ///
    /// A removal flattens the logical state into one fragment, so it needs
    /// every fragment below the head.
    async fn complete_chain(&self, pipeline: &PublishPipeline, cancel: Option<CancellationToken>) -> Result<()> {
        let committed = pipeline.committed();
        if !committed.truncated {
            return Ok(());
        }

        info!(name = %pipeline.name(), head = %committed.head_address, "Re-reading truncated chain");
        let chain = self
            .aggregator(self.resolve_options(cancel))
            .walk(&committed.head_address, None)
            .await?;
        if chain.truncated {
            return Err(StrandError::IncompleteState(committed.head_address.to_string()));
        }
        if !pipeline.complete_chain(&committed.head_address, chain.state) {
            debug!(name = %pipeline.name(), "Head moved during re-read");
        }
        Ok(())
    }

    /// The committed head is ours: cache its name answer and its bytes
    fn after_publish(&self, pipeline: &PublishPipeline) {
        let committed = pipeline.committed();
        self.resolver
            .remember_name(pipeline.name(), &committed.head_address);
        match committed.head.to_json_bytes() {
            Ok(bytes) => self
                .resolver
                .prime_content(&committed.head_address, Bytes::from(bytes)),
            Err(e) => warn!(head = %committed.head_address, error = %e, "Head fragment not cached"),
        }
    }

    /// Store a raw block on the local daemon, queued behind other writes
    pub async fn put_block(&self, data: Bytes) -> Result<ContentAddress> {
        let daemon = self.daemon().ok_or(StrandError::NoLocalDaemon)?;
        let _gate = self.write_gate.lock().await;
        daemon.block_put(data, self.config.publish.add_timeout()).await
    }

    /// Drop cached names and content
    pub fn invalidate(&self) {
        self.resolver.invalidate();
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn resolver_stats(&self) -> ResolverStats {
        self.resolver.stats()
    }

    /// Forget backend rankings for one kind
    pub fn reset_health(&self, kind: ResourceKind) {
        warn!(kind = %kind, "Resetting backend preference");
        self.health.reset(kind);
    }
}
