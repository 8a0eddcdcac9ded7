//! Strand - content-addressed state resolution and synchronization
//!
//! A client-side engine that keeps a user's social-graph state as a chain of
//! immutable, content-addressed fragments behind a mutable name record, and
//! reads and writes it against an unreliable set of backends.
//!
//! ## Components
//!
//! - **Health**: per-kind backend ranking with cooldowns for overloaded origins
//! - **Resolver**: races the local daemon and public gateways, first valid
//!   answer wins
//! - **Backoff**: per-key exponential penalties with in-flight dedup
//! - **State**: walks and merges the fragment chain
//! - **Publish**: optimistic mutations, chunk splitting, one write gate
//! - **Session**: login reconciliation between network and local heads

pub mod backend;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod ids;
pub mod logging;
pub mod publish;
pub mod resolver;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

pub use backend::{Backend, ResourceKind};
pub use config::EngineConfig;
pub use engine::{Engine, FollowHead};
pub use error::{Result, StrandError};
pub use ids::{ContentAddress, Identifier, EMPTY_STATE_ADDRESS};
pub use publish::{Mutation, PublishPipeline};
pub use resolver::{ResolveOptions, Resolved, Strategy};
pub use session::{SessionProvider, StaticSession};
pub use state::{Follow, Post, Profile, UserState};
