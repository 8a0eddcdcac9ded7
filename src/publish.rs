//! Optimistic Publish Pipeline
//!
//! ## Mutation lifecycle
//!
//! ```text
//! Idle ─apply─▶ OptimisticallyApplied ─gate acquired─▶ Uploading ─┬─▶ Published
//!                (visible at once)                                 └─▶ RolledBack
//! ```
//!
//! The visible state is always `committed + pending mutations`, recomputed
//! wholesale and broadcast on a watch channel. Writes queue on one FIFO gate
//! shared by every writer of the local daemon; each plans its fragment from
//! the committed state it finds under the gate. A mutation whose `apply` is
//! cancelled or dropped leaves the pending set when its future goes away.
//!
//! ## Fragment plans
//!
//! - **Split**: a growing list in the head fragment would pass the threshold.
//!   Upload a minimal fragment holding the profile, the new timestamp, only
//!   the new entries, and `next` = previous head.
//! - **Whole**: upload the mutated head fragment. `next` is kept when the head
//!   is already a continuation, else set to the previous head.
//! - **Flatten**: removals cannot reach into older fragments, so the whole
//!   logical state is uploaded as a single fragment with no `next`. Refused
//!   while the committed state is known to be truncated.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::PublishConfig;
use crate::error::{Result, StrandError};
use crate::ids::ContentAddress;
use crate::state::model::{Follow, ListField, Post, Profile, UserState};
use crate::store::{KvStore, KvStoreExt};

const SESSION_NAMESPACE: &str = "session";

/// FIFO gate for heavy writes against the local daemon
pub type WriteGate = Arc<tokio::sync::Mutex<()>>;

/// Write side of the local daemon
#[async_trait]
pub trait ContentWriter: Send + Sync {
    /// Upload and pin bytes
    async fn add(&self, data: Bytes, timeout: Duration) -> Result<ContentAddress>;

    /// Point the name key at `address`; returns the published name
    async fn publish(&self, address: &ContentAddress, key: &str, timeout: Duration) -> Result<String>;
}

// =============================================================================
// Mutations
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mutation {
    AddPost { post_ref: ContentAddress },
    /// Insert, or replace an existing follow with the same address
    Follow { follow: Follow },
    Unfollow { address: String },
    Like { post_ref: ContentAddress },
    Unlike { post_ref: ContentAddress },
    Dislike { post_ref: ContentAddress },
    Undislike { post_ref: ContentAddress },
    SetProfile { profile: Profile },
    UpdateFollowCursor {
        address: String,
        last_seen_ref: ContentAddress,
    },
}

impl Mutation {
    /// List field touched by this mutation
    pub fn field(&self) -> Option<ListField> {
        match self {
            Mutation::AddPost { .. } => Some(ListField::Posts),
            Mutation::Follow { .. }
            | Mutation::Unfollow { .. }
            | Mutation::UpdateFollowCursor { .. } => Some(ListField::Follows),
            Mutation::Like { .. } | Mutation::Unlike { .. } => Some(ListField::Likes),
            Mutation::Dislike { .. } | Mutation::Undislike { .. } => Some(ListField::Dislikes),
            Mutation::SetProfile { .. } => None,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Mutation::Unfollow { .. } | Mutation::Unlike { .. } | Mutation::Undislike { .. }
        )
    }

    /// Apply to a state or fragment in place. New entries go to the front.
    pub fn apply(&self, state: &mut UserState) {
        match self {
            Mutation::AddPost { post_ref } => push_front_unique(&mut state.post_refs, post_ref),
            Mutation::Follow { follow } => upsert_follow(state, follow.clone()),
            Mutation::Unfollow { address } => state.follows.retain(|f| &f.address != address),
            Mutation::Like { post_ref } => push_front_unique(&mut state.liked_refs, post_ref),
            Mutation::Unlike { post_ref } => state.liked_refs.retain(|r| r != post_ref),
            Mutation::Dislike { post_ref } => push_front_unique(&mut state.disliked_refs, post_ref),
            Mutation::Undislike { post_ref } => state.disliked_refs.retain(|r| r != post_ref),
            Mutation::SetProfile { profile } => state.profile = Some(profile.clone()),
            Mutation::UpdateFollowCursor {
                address,
                last_seen_ref,
            } => {
                if let Some(follow) = state.follows.iter_mut().find(|f| &f.address == address) {
                    follow.last_seen_ref = Some(last_seen_ref.clone());
                }
            }
        }
    }

    /// Apply to a head fragment. Follow changes land in the head even when the
    /// follow lives in an older fragment; aggregation keeps the head copy.
    fn apply_to_head(&self, head: &mut UserState, logical: &UserState) {
        if let Mutation::UpdateFollowCursor {
            address,
            last_seen_ref,
        } = self
        {
            if !head.is_following(address) {
                if let Some(existing) = logical.follow(address) {
                    let mut follow = existing.clone();
                    follow.last_seen_ref = Some(last_seen_ref.clone());
                    head.follows.insert(0, follow);
                }
                return;
            }
        }
        self.apply(head);
    }
}

fn push_front_unique(list: &mut Vec<ContentAddress>, item: &ContentAddress) {
    if !list.contains(item) {
        list.insert(0, item.clone());
    }
}

fn upsert_follow(state: &mut UserState, follow: Follow) {
    match state.follows.iter_mut().find(|f| f.address == follow.address) {
        Some(existing) => *existing = follow,
        None => state.follows.insert(0, follow),
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Committed state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Aggregated view of the whole chain
    pub logical: UserState,
    /// Head fragment as last uploaded
    pub head: UserState,
    /// Empty sentinel until the first publish
    pub head_address: ContentAddress,
    /// `logical` misses fragments the chain walk could not reach
    pub truncated: bool,
}

impl SessionState {
    /// A user that has never published
    pub fn fresh(name_hint: Option<&str>) -> Self {
        Self {
            logical: UserState::empty(name_hint),
            head: UserState::empty(name_hint),
            head_address: ContentAddress::empty(),
            truncated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Split,
    Whole,
    Flatten,
}

/// What to upload for one mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub kind: PlanKind,
    /// Fragment to upload as the new head
    pub fragment: UserState,
    /// Logical state once the fragment is published
    pub logical: UserState,
}

/// Compute the next head fragment from committed state
pub fn plan(committed: &SessionState, mutation: &Mutation, threshold: usize, now_ms: i64) -> Plan {
    let updated_at = now_ms.max(committed.logical.updated_at + 1);
    let previous_head =
        (!committed.head_address.is_empty_sentinel()).then(|| committed.head_address.clone());

    let mut logical = committed.logical.clone();
    mutation.apply(&mut logical);
    logical.updated_at = updated_at;
    logical.next = None;

    if mutation.is_removal() {
        return Plan {
            kind: PlanKind::Flatten,
            fragment: logical.clone(),
            logical,
        };
    }

    let mut head = committed.head.clone();
    mutation.apply_to_head(&mut head, &committed.logical);
    head.profile = logical.profile.clone();
    head.updated_at = updated_at;

    if let Some(field) = mutation.field() {
        let before = committed.head.len_of(field);
        let after = head.len_of(field);
        if after > before && after > threshold && previous_head.is_some() {
            let fragment = UserState {
                profile: logical.profile.clone(),
                updated_at,
                next: previous_head,
                ..front_entries(&head, field, after - before)
            };
            return Plan {
                kind: PlanKind::Split,
                fragment,
                logical,
            };
        }
    }

    if head.next.is_none() {
        head.next = previous_head;
    }
    Plan {
        kind: PlanKind::Whole,
        fragment: head,
        logical,
    }
}

/// Fragment holding only the first `count` entries of `field`
fn front_entries(source: &UserState, field: ListField, count: usize) -> UserState {
    let mut fragment = UserState::default();
    match field {
        ListField::Posts => fragment.post_refs = source.post_refs.iter().take(count).cloned().collect(),
        ListField::Follows => fragment.follows = source.follows.iter().take(count).cloned().collect(),
        ListField::Likes => fragment.liked_refs = source.liked_refs.iter().take(count).cloned().collect(),
        ListField::Dislikes => {
            fragment.disliked_refs = source.disliked_refs.iter().take(count).cloned().collect()
        }
    }
    fragment
}

// =============================================================================
// Pipeline
// =============================================================================

/// Head saved after the last successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticHead {
    pub address: ContentAddress,
    pub updated_at: i64,
}

fn optimistic_head_key(name: &str) -> String {
    format!("optimistic_head:{}", name)
}

pub fn load_optimistic_head(store: &dyn KvStore, name: &str) -> Option<OptimisticHead> {
    match store.get_json(SESSION_NAMESPACE, &optimistic_head_key(name)) {
        Ok(head) => head,
        Err(e) => {
            warn!(name = %name, error = %e, "Unreadable optimistic head");
            None
        }
    }
}

struct Inner {
    committed: SessionState,
    pending: Vec<(u64, Mutation)>,
    next_id: u64,
}

impl Inner {
    fn visible(&self) -> UserState {
        let mut state = self.committed.logical.clone();
        for (_, mutation) in &self.pending {
            mutation.apply(&mut state);
        }
        state
    }
}

pub struct PublishPipeline {
    name: String,
    inner: Mutex<Inner>,
    visible: watch::Sender<UserState>,
    write_gate: WriteGate,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: PublishConfig,
}

impl PublishPipeline {
    pub fn new(
        name: impl Into<String>,
        initial: SessionState,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        config: PublishConfig,
    ) -> Self {
        let (visible, _) = watch::channel(initial.logical.clone());
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                committed: initial,
                pending: Vec::new(),
                next_id: 0,
            }),
            visible,
            write_gate: WriteGate::default(),
            store,
            clock,
            config,
        }
    }

    /// Queue writes on a gate shared with other daemon writers
    pub fn with_write_gate(mut self, gate: WriteGate) -> Self {
        self.write_gate = gate;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current visible state
    pub fn current(&self) -> UserState {
        self.visible.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UserState> {
        self.visible.subscribe()
    }

    /// Last committed state
    pub fn committed(&self) -> SessionState {
        self.lock().committed.clone()
    }

    /// Apply a mutation optimistically and publish it.
    ///
    /// Returns the new head address. On failure the visible state is rolled
    /// back and [`StrandError::PublishFailed`] is returned. Cancellation, or
    /// dropping the returned future, rolls back the same way; cancellation
    /// answers [`StrandError::Cancelled`].
    pub async fn apply(
        &self,
        mutation: Mutation,
        writer: Arc<dyn ContentWriter>,
        cancel: Option<CancellationToken>,
    ) -> Result<ContentAddress> {
        let pending = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.push((id, mutation.clone()));
            self.visible.send_replace(inner.visible());
            PendingMutation {
                pipeline: self,
                id,
                settled: false,
            }
        };
        debug!(name = %self.name, ?mutation, "Mutation applied optimistically");

        let _gate = until_cancelled(cancel.as_ref(), async {
            Ok::<_, StrandError>(self.write_gate.lock().await)
        })
        .await?;

        let committed = self.lock().committed.clone();
        let plan = plan(
            &committed,
            &mutation,
            self.config.chunk_threshold,
            self.clock.now_ms(),
        );
        let result = if plan.kind == PlanKind::Flatten && committed.truncated {
            Err(StrandError::IncompleteState(committed.head_address.to_string()))
        } else {
            until_cancelled(cancel.as_ref(), self.upload(&plan, writer.as_ref())).await
        };

        match result {
            Ok(address) => {
                pending.settle(Some(SessionState {
                    logical: plan.logical,
                    head: plan.fragment,
                    head_address: address.clone(),
                    truncated: committed.truncated,
                }));
                let updated_at = self.lock().committed.logical.updated_at;

                self.save_optimistic_head(&address, updated_at);
                info!(
                    name = %self.name,
                    head = %address,
                    plan = ?plan.kind,
                    updated_at,
                    "Published"
                );
                Ok(address)
            }
            Err(e) => {
                pending.settle(None);
                warn!(name = %self.name, error = %e, "Publish failed, rolled back");
                Err(match e {
                    e @ (StrandError::PublishFailed(_)
                    | StrandError::Cancelled
                    | StrandError::IncompleteState(_)) => e,
                    other => StrandError::PublishFailed(other.to_string()),
                })
            }
        }
    }

    /// Upload a post object, then add it to the state
    pub async fn publish_post(
        &self,
        post: &Post,
        writer: Arc<dyn ContentWriter>,
        cancel: Option<CancellationToken>,
    ) -> Result<ContentAddress> {
        let bytes = serde_json::to_vec(post)?;
        let post_ref = until_cancelled(cancel.as_ref(), async {
            let _gate = self.write_gate.lock().await;
            writer
                .add(Bytes::from(bytes), self.config.add_timeout())
                .await
                .map_err(|e| StrandError::PublishFailed(e.to_string()))
        })
        .await?;
        debug!(name = %self.name, post = %post_ref, "Post uploaded");

        self.apply(
            Mutation::AddPost {
                post_ref: post_ref.clone(),
            },
            writer,
            cancel,
        )
        .await?;
        Ok(post_ref)
    }

    /// Replace committed state wholesale (after login reconciliation)
    pub fn reset(&self, state: SessionState) {
        let mut inner = self.lock();
        inner.committed = state;
        inner.pending.clear();
        self.visible.send_replace(inner.visible());
    }

    /// Swap in a complete logical state for a truncated committed head.
    ///
    /// Returns `false` if the committed head moved on since `head` was read.
    pub fn complete_chain(&self, head: &ContentAddress, logical: UserState) -> bool {
        let mut inner = self.lock();
        if &inner.committed.head_address != head {
            return false;
        }
        inner.committed.logical = logical;
        inner.committed.truncated = false;
        self.visible.send_replace(inner.visible());
        true
    }

    async fn upload(&self, plan: &Plan, writer: &dyn ContentWriter) -> Result<ContentAddress> {
        let bytes = plan.fragment.to_json_bytes()?;
        let address = writer
            .add(Bytes::from(bytes), self.config.add_timeout())
            .await?;
        writer
            .publish(&address, &self.config.name_key, self.config.publish_timeout())
            .await?;
        Ok(address)
    }

    fn save_optimistic_head(&self, address: &ContentAddress, updated_at: i64) {
        let record = OptimisticHead {
            address: address.clone(),
            updated_at,
        };
        if let Err(e) = self
            .store
            .set_json(SESSION_NAMESPACE, &optimistic_head_key(&self.name), &record)
        {
            warn!(name = %self.name, error = %e, "Failed to persist optimistic head");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A mutation in the pending set; leaves it exactly once
struct PendingMutation<'a> {
    pipeline: &'a PublishPipeline,
    id: u64,
    settled: bool,
}

impl PendingMutation<'_> {
    /// Leave the pending set, committing `state` if the publish succeeded
    fn settle(mut self, state: Option<SessionState>) {
        self.remove(state);
    }

    fn remove(&mut self, state: Option<SessionState>) {
        self.settled = true;
        let mut inner = self.pipeline.lock();
        inner.pending.retain(|(pending_id, _)| *pending_id != self.id);
        if let Some(state) = state {
            inner.committed = state;
        }
        self.pipeline.visible.send_replace(inner.visible());
    }
}

impl Drop for PendingMutation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(name = %self.pipeline.name, "Publish abandoned, rolled back");
            self.remove(None);
        }
    }
}

/// Run `work` unless `cancel` fires first
async fn until_cancelled<T>(
    cancel: Option<&CancellationToken>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        Some(cancel) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StrandError::Cancelled),
            result = work => result,
        },
        None => work.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::test_address;
    use crate::state::aggregate::merge;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn post(n: usize) -> ContentAddress {
        test_address(n as u64)
    }

    /// Writer storing fragments by synthetic address
    #[derive(Default)]
    struct MemoryWriter {
        objects: Mutex<HashMap<ContentAddress, Bytes>>,
        published: Mutex<Vec<ContentAddress>>,
        counter: AtomicUsize,
        fail_publish: AtomicBool,
    }

    impl MemoryWriter {
        fn fragment(&self, address: &ContentAddress) -> UserState {
            let objects = self.objects.lock().unwrap();
            serde_json::from_slice(objects.get(address).unwrap()).unwrap()
        }

        /// Walk the uploaded chain the way the aggregator does
        fn aggregate(&self, head: &ContentAddress) -> UserState {
            let mut fragments = Vec::new();
            let mut current = Some(head.clone());
            while let Some(address) = current {
                let fragment = self.fragment(&address);
                current = fragment.next.clone();
                fragments.push(fragment);
            }
            merge(fragments)
        }
    }

    #[async_trait]
    impl ContentWriter for MemoryWriter {
        async fn add(&self, data: Bytes, _timeout: Duration) -> Result<ContentAddress> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let address = test_address(1_000 + n as u64);
            self.objects.lock().unwrap().insert(address.clone(), data);
            Ok(address)
        }

        async fn publish(&self, address: &ContentAddress, _key: &str, _timeout: Duration) -> Result<String> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(StrandError::Gateway {
                    status: 500,
                    url: "http://127.0.0.1:5001/api/v0/name/publish".into(),
                });
            }
            self.published.lock().unwrap().push(address.clone());
            Ok("k51self".into())
        }
    }

    fn pipeline(store: Arc<dyn KvStore>) -> PublishPipeline {
        PublishPipeline::new(
            "k51self",
            SessionState::fresh(Some("ada")),
            store,
            Arc::new(ManualClock::new(1_000)),
            PublishConfig::default(),
        )
    }

    #[test]
    fn test_plan_first_publish_has_no_next() {
        let committed = SessionState::fresh(Some("ada"));
        let plan = plan(&committed, &Mutation::AddPost { post_ref: post(0) }, 5, 10);
        assert_eq!(plan.kind, PlanKind::Whole);
        assert!(plan.fragment.next.is_none());
        assert_eq!(plan.fragment.post_refs, vec![post(0)]);
        assert_eq!(plan.logical.updated_at, 10);
    }

    #[test]
    fn test_plan_splits_past_threshold() {
        let head_address = post(6);
        let head = UserState {
            post_refs: (0..5).map(post).collect(),
            updated_at: 50,
            ..Default::default()
        };
        let committed = SessionState {
            logical: head.clone(),
            head: head.clone(),
            head_address: head_address.clone(),
            truncated: false,
        };

        let plan = plan(&committed, &Mutation::AddPost { post_ref: post(5) }, 5, 10);
        assert_eq!(plan.kind, PlanKind::Split);
        assert_eq!(plan.fragment.post_refs, vec![post(5)]);
        assert!(plan.fragment.follows.is_empty());
        assert_eq!(plan.fragment.next, Some(head_address));
        // Clock behind the committed state still moves forward
        assert_eq!(plan.fragment.updated_at, 51);
        assert_eq!(plan.logical.post_refs.len(), 6);
    }

    #[test]
    fn test_plan_keeps_existing_continuation() {
        let tail = post(6);
        let head = UserState {
            post_refs: vec![post(0)],
            updated_at: 5,
            next: Some(tail.clone()),
            ..Default::default()
        };
        let committed = SessionState {
            logical: head.clone(),
            head,
            head_address: post(5),
            truncated: false,
        };
        let plan = plan(&committed, &Mutation::Like { post_ref: post(1) }, 5, 10);
        assert_eq!(plan.kind, PlanKind::Whole);
        assert_eq!(plan.fragment.next, Some(tail));
        assert_eq!(plan.fragment.liked_refs, vec![post(1)]);
    }

    #[test]
    fn test_plan_flattens_removals() {
        let logical = UserState {
            liked_refs: vec![post(0), post(1)],
            follows: vec![Follow::new("k51bob")],
            updated_at: 5,
            ..Default::default()
        };
        let committed = SessionState {
            logical: logical.clone(),
            head: UserState {
                liked_refs: vec![post(0)],
                next: Some(post(6)),
                ..Default::default()
            },
            head_address: post(5),
            truncated: false,
        };
        let plan = plan(&committed, &Mutation::Unlike { post_ref: post(1) }, 5, 10);
        assert_eq!(plan.kind, PlanKind::Flatten);
        assert!(plan.fragment.next.is_none());
        assert_eq!(plan.fragment.liked_refs, vec![post(0)]);
        assert_eq!(plan.fragment.follows.len(), 1);
    }

    #[test]
    fn test_cursor_update_reaches_older_follow() {
        let logical = UserState {
            follows: vec![Follow::new("k51bob")],
            ..Default::default()
        };
        let committed = SessionState {
            logical,
            head: UserState {
                next: Some(post(6)),
                ..Default::default()
            },
            head_address: post(5),
            truncated: false,
        };
        let plan = plan(
            &committed,
            &Mutation::UpdateFollowCursor {
                address: "k51bob".into(),
                last_seen_ref: post(2),
            },
            5,
            10,
        );
        assert_eq!(plan.fragment.follows[0].last_seen_ref, Some(post(2)));
        assert_eq!(plan.logical.follows[0].last_seen_ref, Some(post(2)));
    }

    #[tokio::test]
    async fn test_chunk_round_trip() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        let writer = Arc::new(MemoryWriter::default());

        let mut heads = Vec::new();
        for n in 0..6 {
            let head = pipeline
                .apply(Mutation::AddPost { post_ref: post(n) }, writer.clone(), None)
                .await
                .unwrap();
            heads.push(head);
        }

        let newest = writer.fragment(&heads[5]);
        assert_eq!(newest.next.as_ref(), Some(&heads[4]));
        assert_eq!(newest.post_refs, vec![post(5)]);

        let aggregated = writer.aggregate(&heads[5]);
        assert_eq!(aggregated.post_refs.len(), 6);
        for n in 0..6 {
            assert!(aggregated.post_refs.contains(&post(n)));
        }
        assert_eq!(aggregated.post_refs, pipeline.current().post_refs);

        let saved = load_optimistic_head(store.as_ref(), "k51self").unwrap();
        assert_eq!(saved.address, heads[5]);
        assert_eq!(saved.updated_at, pipeline.committed().logical.updated_at);
    }

    #[tokio::test]
    async fn test_failed_publish_rolls_back() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        let writer = Arc::new(MemoryWriter::default());

        pipeline
            .apply(Mutation::AddPost { post_ref: post(0) }, writer.clone(), None)
            .await
            .unwrap();
        let before = pipeline.current();
        let before_bytes = serde_json::to_vec(&before).unwrap();
        let saved_before = load_optimistic_head(store.as_ref(), "k51self");

        writer.fail_publish.store(true, Ordering::SeqCst);
        let mut updates = pipeline.subscribe();
        let err = pipeline
            .apply(Mutation::Follow { follow: Follow::new("k51bob") }, writer.clone(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, StrandError::PublishFailed(_)));
        assert!(updates.has_changed().unwrap());
        assert_eq!(serde_json::to_vec(&*updates.borrow_and_update()).unwrap(), before_bytes);
        assert_eq!(serde_json::to_vec(&pipeline.current()).unwrap(), before_bytes);
        assert_eq!(load_optimistic_head(store.as_ref(), "k51self"), saved_before);
    }

    #[tokio::test]
    async fn test_optimistic_state_visible_before_upload() {
        struct GatedWriter {
            release: tokio::sync::Notify,
            inner: MemoryWriter,
        }

        #[async_trait]
        impl ContentWriter for GatedWriter {
            async fn add(&self, data: Bytes, timeout: Duration) -> Result<ContentAddress> {
                self.release.notified().await;
                self.inner.add(data, timeout).await
            }

            async fn publish(&self, address: &ContentAddress, key: &str, timeout: Duration) -> Result<String> {
                self.inner.publish(address, key, timeout).await
            }
        }

        let pipeline = Arc::new(pipeline(Arc::new(MemoryStore::new())));
        let writer = Arc::new(GatedWriter {
            release: tokio::sync::Notify::new(),
            inner: MemoryWriter::default(),
        });
        let mut updates = pipeline.subscribe();

        let task = {
            let pipeline = pipeline.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                pipeline
                    .apply(Mutation::Like { post_ref: post(3) }, writer, None)
                    .await
            })
        };

        updates.changed().await.unwrap();
        assert_eq!(pipeline.current().liked_refs, vec![post(3)]);
        assert_eq!(pipeline.committed().head_address, ContentAddress::empty());

        writer.release.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(pipeline.committed().logical.liked_refs, vec![post(3)]);
    }

    /// Writer taking 100ms per call and recording overlapping calls
    #[derive(Default)]
    struct SlowWriter {
        inner: MemoryWriter,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl SlowWriter {
        async fn busy(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContentWriter for SlowWriter {
        async fn add(&self, data: Bytes, timeout: Duration) -> Result<ContentAddress> {
            self.busy().await;
            self.inner.add(data, timeout).await
        }

        async fn publish(&self, address: &ContentAddress, key: &str, timeout: Duration) -> Result<String> {
            self.busy().await;
            self.inner.publish(address, key, timeout).await
        }
    }

    /// Writer whose uploads never finish
    struct HangingWriter;

    #[async_trait]
    impl ContentWriter for HangingWriter {
        async fn add(&self, _data: Bytes, _timeout: Duration) -> Result<ContentAddress> {
            std::future::pending().await
        }

        async fn publish(&self, _address: &ContentAddress, _key: &str, _timeout: Duration) -> Result<String> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_queue_in_order() {
        let pipeline = Arc::new(pipeline(Arc::new(MemoryStore::new())));
        let writer = Arc::new(SlowWriter::default());

        let first = {
            let (pipeline, writer) = (pipeline.clone(), writer.clone());
            tokio::spawn(async move {
                pipeline
                    .apply(Mutation::Like { post_ref: post(1) }, writer, None)
                    .await
            })
        };
        // Let the first write take the gate
        tokio::task::yield_now().await;
        let second = {
            let (pipeline, writer) = (pipeline.clone(), writer.clone());
            tokio::spawn(async move {
                pipeline
                    .apply(Mutation::Follow { follow: Follow::new("k51bob") }, writer, None)
                    .await
            })
        };

        let first_head = first.await.unwrap().unwrap();
        let second_head = second.await.unwrap().unwrap();

        assert_eq!(writer.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(
            *writer.inner.published.lock().unwrap(),
            vec![first_head.clone(), second_head.clone()]
        );
        // The second write planned from the first one's committed head
        assert_eq!(writer.inner.fragment(&second_head).next, Some(first_head));

        let committed = pipeline.committed();
        assert_eq!(committed.head_address, second_head);
        assert_eq!(committed.logical.liked_refs, vec![post(1)]);
        assert!(committed.logical.is_following("k51bob"));
        assert_eq!(pipeline.current(), committed.logical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_gate_spans_pipelines() {
        let gate = WriteGate::default();
        let ours = Arc::new(pipeline(Arc::new(MemoryStore::new())).with_write_gate(gate.clone()));
        let theirs = Arc::new(
            PublishPipeline::new(
                "k51other",
                SessionState::fresh(None),
                Arc::new(MemoryStore::new()),
                Arc::new(ManualClock::new(1_000)),
                PublishConfig::default(),
            )
            .with_write_gate(gate),
        );
        let writer = Arc::new(SlowWriter::default());

        let a = ours.apply(Mutation::Like { post_ref: post(1) }, writer.clone(), None);
        let b = theirs.apply(Mutation::Like { post_ref: post(2) }, writer.clone(), None);
        let (a, b) = tokio::join!(a, b);
        a.unwrap();
        b.unwrap();

        assert_eq!(writer.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(writer.inner.published.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_apply_rolls_back() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let before = pipeline.current();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.apply(Mutation::Like { post_ref: post(1) }, Arc::new(HangingWriter), None),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(pipeline.current(), before);
        assert!(pipeline.current().liked_refs.is_empty());
        assert!(pipeline.committed().head_address.is_empty_sentinel());

        // The gate was released with the dropped future
        let writer = Arc::new(MemoryWriter::default());
        pipeline
            .apply(Mutation::Like { post_ref: post(2) }, writer, None)
            .await
            .unwrap();
        assert_eq!(pipeline.current().liked_refs, vec![post(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_apply_rolls_back() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let before = pipeline.current();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = pipeline
            .apply(
                Mutation::Follow { follow: Follow::new("k51bob") },
                Arc::new(HangingWriter),
                Some(cancel),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StrandError::Cancelled));
        assert_eq!(pipeline.current(), before);
    }

    #[tokio::test]
    async fn test_truncated_state_refuses_removal_until_completed() {
        let head_address = post(5);
        let partial = UserState {
            liked_refs: vec![post(0), post(1)],
            updated_at: 5,
            ..Default::default()
        };
        let initial = SessionState {
            logical: partial.clone(),
            head: UserState {
                liked_refs: vec![post(0)],
                updated_at: 5,
                next: Some(post(6)),
                ..Default::default()
            },
            head_address: head_address.clone(),
            truncated: true,
        };
        let pipeline = PublishPipeline::new(
            "k51self",
            initial,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(1_000)),
            PublishConfig::default(),
        );
        let writer = Arc::new(MemoryWriter::default());

        let err = pipeline
            .apply(Mutation::Unlike { post_ref: post(1) }, writer.clone(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::IncompleteState(_)));
        assert_eq!(writer.counter.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.current(), partial);

        // The whole chain, including the part the login walk missed
        let mut full = partial.clone();
        full.follows.push(Follow::new("k51bob"));
        assert!(!pipeline.complete_chain(&post(9), full.clone()));
        assert!(pipeline.complete_chain(&head_address, full));
        assert!(!pipeline.committed().truncated);

        let head = pipeline
            .apply(Mutation::Unlike { post_ref: post(1) }, writer.clone(), None)
            .await
            .unwrap();
        let flattened = writer.fragment(&head);
        assert!(flattened.next.is_none());
        assert_eq!(flattened.liked_refs, vec![post(0)]);
        assert!(flattened.is_following("k51bob"));
    }

    #[tokio::test]
    async fn test_truncated_state_still_appends() {
        let initial = SessionState {
            logical: UserState::default(),
            head: UserState {
                next: Some(post(6)),
                ..Default::default()
            },
            head_address: post(5),
            truncated: true,
        };
        let pipeline = PublishPipeline::new(
            "k51self",
            initial,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(1_000)),
            PublishConfig::default(),
        );
        let writer = Arc::new(MemoryWriter::default());

        let head = pipeline
            .apply(Mutation::Like { post_ref: post(1) }, writer.clone(), None)
            .await
            .unwrap();
        assert_eq!(writer.fragment(&head).next, Some(post(6)));
        assert!(pipeline.committed().truncated);
    }

    #[tokio::test]
    async fn test_publish_post_uploads_object_first() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let writer = Arc::new(MemoryWriter::default());
        let new_post = Post {
            timestamp: 1,
            content: "hello".into(),
            author_address: "k51self".into(),
            parent_ref: None,
            media_ref: None,
            thumbnail_ref: None,
            media_kind: None,
            file_name: None,
        };

        let post_ref = pipeline.publish_post(&new_post, writer.clone(), None).await.unwrap();
        let stored: Post = {
            let objects = writer.objects.lock().unwrap();
            serde_json::from_slice(objects.get(&post_ref).unwrap()).unwrap()
        };
        assert_eq!(stored, new_post);
        assert_eq!(pipeline.current().post_refs, vec![post_ref]);
        assert_eq!(writer.published.lock().unwrap().len(), 1);
    }
}
