//! Public gateway backends
//!
//! A public backend is described by a URL template:
//!
//! - path style: `https://ipfs.io/ipfs/` (the id is appended)
//! - subdomain style: `https://{id}.ipfs.dweb.link` (the `{id}` token is replaced)
//!
//! Subdomain backends need a DNS-safe id, so legacy addresses are re-encoded
//! and anything that cannot be re-encoded is ineligible.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::Result;
use crate::ids::Identifier;
use crate::store::{KvStore, KvStoreExt};

/// Substitution token for subdomain-style templates
pub const ID_TOKEN: &str = "{id}";

/// Namespace for user settings consumed (not owned) by the engine
pub const SETTINGS_NAMESPACE: &str = "settings";

/// Settings key holding a custom content gateway list
pub const CUSTOM_GATEWAYS_KEY: &str = "gateways";

/// Settings key holding a custom name-resolution gateway list
pub const CUSTOM_NAME_GATEWAYS_KEY: &str = "name_gateways";

/// Built-in content gateways
pub const DEFAULT_CONTENT_GATEWAYS: &[&str] = &[
    "https://{id}.ipfs.dweb.link",
    "https://ipfs.io/ipfs/",
    "https://{id}.ipfs.w3s.link",
    "https://gateway.pinata.cloud/ipfs/",
    "https://dweb.link/ipfs/",
    "https://4everland.io/ipfs/",
];

/// Built-in name-resolution gateways
pub const DEFAULT_NAME_GATEWAYS: &[&str] = &[
    "https://ipfs.io/ipns/",
    "https://{id}.ipns.dweb.link",
    "https://dweb.link/ipns/",
];

/// What a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Raw bytes of a content address
    Content,
    /// Content address a name currently points at
    Name,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Content => "content",
            ResourceKind::Name => "name",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URL shape of a public backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStyle {
    Path,
    Subdomain,
}

/// A public read-only gateway. The local daemon is reached through
/// [`crate::resolver::LocalBackend`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Normalized origin, the health registry key
    pub origin: String,
    pub url_template: String,
}

impl Backend {
    /// Build a public backend from a URL template.
    ///
    /// Returns `None` for templates that do not parse as URLs.
    pub fn public(url_template: &str) -> Option<Self> {
        let probe = url_template.replace(&format!("{}.", ID_TOKEN), "");
        let origin = origin_of(&probe)?;
        Some(Self {
            origin,
            url_template: url_template.to_string(),
        })
    }

    pub fn style(&self) -> UrlStyle {
        if self.url_template.contains(ID_TOKEN) {
            UrlStyle::Subdomain
        } else {
            UrlStyle::Path
        }
    }

    /// Concrete request URL for an identifier, or `None` if this backend
    /// cannot serve it.
    pub fn url_for(&self, identifier: &Identifier) -> Option<String> {
        match self.style() {
            UrlStyle::Path => {
                let mut url = self.url_template.clone();
                if !url.ends_with('/') {
                    url.push('/');
                }
                url.push_str(identifier.as_str());
                Some(url)
            }
            UrlStyle::Subdomain => {
                let label = match identifier {
                    Identifier::Address(address) => address.dns_label()?,
                    Identifier::Name(name) => dns_safe_name(name)?,
                };
                Some(self.url_template.replace(ID_TOKEN, &label))
            }
        }
    }
}

/// DNSLink names inline into a single label by swapping `.` and `-`
fn dns_safe_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if name.contains('.') {
        Some(name.replace('-', "--").replace('.', "-"))
    } else {
        Some(name.to_lowercase())
    }
}

/// Derive the normalized origin of a URL.
///
/// Subdomain gateway hosts (`<id>.ipfs.<host>` / `<id>.ipns.<host>`) lose the
/// leading id label so every request to a gateway maps to one origin.
/// Returns `None` for malformed URLs.
pub fn origin_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let labels: Vec<&str> = host.split('.').collect();
    let host = if labels.len() >= 3 && matches!(labels[1], "ipfs" | "ipns") {
        labels[1..].join(".")
    } else {
        host.to_string()
    };
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

/// Gateway lists from persisted user settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewaySettings {
    pub content: Option<Vec<String>>,
    pub name: Option<Vec<String>>,
}

impl GatewaySettings {
    /// Read custom gateway lists; absent keys mean "use the defaults"
    pub fn load(store: &dyn KvStore) -> Result<Self> {
        Ok(Self {
            content: store.get_json(SETTINGS_NAMESPACE, CUSTOM_GATEWAYS_KEY)?,
            name: store.get_json(SETTINGS_NAMESPACE, CUSTOM_NAME_GATEWAYS_KEY)?,
        })
    }

    pub fn templates(&self, kind: ResourceKind) -> Option<&[String]> {
        match kind {
            ResourceKind::Content => self.content.as_deref(),
            ResourceKind::Name => self.name.as_deref(),
        }
        .filter(|list| !list.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ContentAddress, EMPTY_STATE_ADDRESS};
    use crate::store::MemoryStore;

    const V1: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

    #[test]
    fn test_path_style_url() {
        let backend = Backend::public("https://ipfs.io/ipfs").unwrap();
        assert_eq!(backend.style(), UrlStyle::Path);
        assert_eq!(backend.origin, "https://ipfs.io");

        let id = Identifier::Address(ContentAddress::parse(V1).unwrap());
        assert_eq!(
            backend.url_for(&id).unwrap(),
            format!("https://ipfs.io/ipfs/{}", V1)
        );
    }

    #[test]
    fn test_subdomain_style_url() {
        let backend = Backend::public("https://{id}.ipfs.dweb.link").unwrap();
        assert_eq!(backend.style(), UrlStyle::Subdomain);
        assert_eq!(backend.origin, "https://ipfs.dweb.link");

        let legacy = Identifier::Address(ContentAddress::parse(EMPTY_STATE_ADDRESS).unwrap());
        let url = backend.url_for(&legacy).unwrap();
        assert!(url.starts_with("https://bafy"));
        assert!(url.ends_with(".ipfs.dweb.link"));

        let name = Identifier::Name("my-site.example.org".into());
        let ipns = Backend::public("https://{id}.ipns.dweb.link").unwrap();
        assert_eq!(
            ipns.url_for(&name).unwrap(),
            "https://my--site-example-org.ipns.dweb.link"
        );
    }

    #[test]
    fn test_origin_normalization() {
        assert_eq!(
            origin_of(&format!("https://{}.ipfs.dweb.link/a/b", V1)).unwrap(),
            "https://ipfs.dweb.link"
        );
        assert_eq!(
            origin_of("http://127.0.0.1:5001/api/v0/cat").unwrap(),
            "http://127.0.0.1:5001"
        );
        assert!(origin_of("not a url").is_none());
        assert!(Backend::public("::::").is_none());
    }

    #[test]
    fn test_settings_override() {
        let store = MemoryStore::new();
        let settings = GatewaySettings::load(&store).unwrap();
        assert!(settings.templates(ResourceKind::Content).is_none());

        store
            .set_json(
                SETTINGS_NAMESPACE,
                CUSTOM_GATEWAYS_KEY,
                &vec!["https://my.gateway/ipfs/"],
            )
            .unwrap();
        let settings = GatewaySettings::load(&store).unwrap();
        assert_eq!(
            settings.templates(ResourceKind::Content).unwrap(),
            &["https://my.gateway/ipfs/".to_string()]
        );
        assert!(settings.templates(ResourceKind::Name).is_none());
    }
}
