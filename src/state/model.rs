//! User state documents
//!
//! The same shape serves as a chain fragment (with `next`) and as the
//! aggregated logical state (`next` always `None`).

use serde::{Deserialize, Serialize};

use crate::ids::ContentAddress;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl Profile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bio: None,
        }
    }
}

/// A followed user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    /// The followed user's name record
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Last known head fragment of the followed user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ref: Option<ContentAddress>,
}

impl Follow {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            last_seen_ref: None,
        }
    }
}

/// One fragment, or the aggregated view of a chain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub post_refs: Vec<ContentAddress>,
    #[serde(default)]
    pub follows: Vec<Follow>,
    #[serde(default)]
    pub liked_refs: Vec<ContentAddress>,
    #[serde(default)]
    pub disliked_refs: Vec<ContentAddress>,
    /// Milliseconds since the epoch; authoritative on the head only
    #[serde(default)]
    pub updated_at: i64,
    /// Older fragment
    #[serde(default)]
    pub next: Option<ContentAddress>,
}

/// The list fields of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListField {
    Posts,
    Follows,
    Likes,
    Dislikes,
}

impl ListField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListField::Posts => "postRefs",
            ListField::Follows => "follows",
            ListField::Likes => "likedRefs",
            ListField::Dislikes => "dislikedRefs",
        }
    }
}

impl UserState {
    /// State of a user that has never published
    pub fn empty(name_hint: Option<&str>) -> Self {
        Self {
            profile: name_hint.map(Profile::named),
            ..Default::default()
        }
    }

    pub fn len_of(&self, field: ListField) -> usize {
        match field {
            ListField::Posts => self.post_refs.len(),
            ListField::Follows => self.follows.len(),
            ListField::Likes => self.liked_refs.len(),
            ListField::Dislikes => self.disliked_refs.len(),
        }
    }

    pub fn is_following(&self, address: &str) -> bool {
        self.follows.iter().any(|f| f.address == address)
    }

    pub fn follow(&self, address: &str) -> Option<&Follow> {
        self.follows.iter().find(|f| f.address == address)
    }

    /// Canonical JSON bytes used for upload
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Immutable post object; edits are new posts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub timestamp: i64,
    pub content: String,
    pub author_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<ContentAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<ContentAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<ContentAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_json_shape() {
        let json = r#"{
            "profile": {"name": "ada"},
            "postRefs": ["bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku"],
            "follows": [{"address": "k51abc", "lastSeenRef": "bafyhead"}],
            "updatedAt": 1700000000000,
            "next": null
        }"#;
        let state: UserState = serde_json::from_str(json).unwrap();
        assert_eq!(state.profile.as_ref().unwrap().name, "ada");
        assert_eq!(state.len_of(ListField::Posts), 1);
        assert!(state.liked_refs.is_empty());
        assert_eq!(
            state.follow("k51abc").unwrap().last_seen_ref.as_ref().unwrap().as_str(),
            "bafyhead"
        );

        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("next").unwrap().is_null());
        assert!(value.get("dislikedRefs").unwrap().as_array().unwrap().is_empty());
        assert!(value["follows"][0].get("name").is_none());
    }

    #[test]
    fn test_empty_state_seeded_with_hint() {
        let state = UserState::empty(Some("bob"));
        assert_eq!(state.profile, Some(Profile::named("bob")));
        assert_eq!(state.updated_at, 0);
        assert!(state.next.is_none());
        assert!(UserState::empty(None).profile.is_none());
    }

    #[test]
    fn test_post_round_trip_keeps_optional_fields_out() {
        let post = Post {
            timestamp: 1,
            content: "hi".into(),
            author_address: "k51abc".into(),
            parent_ref: None,
            media_ref: None,
            thumbnail_ref: None,
            media_kind: None,
            file_name: None,
        };
        let value = serde_json::to_value(&post).unwrap();
        assert_eq!(value["authorAddress"], "k51abc");
        assert!(value.get("parentRef").is_none());
    }
}
