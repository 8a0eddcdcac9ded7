//! User state: document model and chain aggregation

pub mod aggregate;
pub mod model;

pub use aggregate::{merge, Chain, FragmentSource, ResolverFragmentSource, StateAggregator};
pub use model::{Follow, ListField, Post, Profile, UserState};
