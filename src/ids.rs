//! Identifiers - mutable names and immutable content addresses
//!
//! Content addresses are CIDs. Two encodings matter to backend selection:
//!
//! - **Legacy**: CIDv0, base58btc (`Qm...`), case-sensitive, so it cannot be
//!   used as a DNS label by subdomain gateways as-is
//! - **Modern**: CIDv1 (`bafy...`, `bafk...`), DNS-safe in base32
//!
//! A name is anything else: an IPNS key (a CIDv1 with the `libp2p-key` codec,
//! usually `k51...`) or a DNSLink domain.

use cid::{Cid, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StrandError};

/// Multicodec code of `libp2p-key` - CIDs with this codec name a key, not content
const LIBP2P_KEY_CODEC: u64 = 0x72;

/// The well-known empty directory. Terminal sentinel for a user that has
/// never published any state.
pub const EMPTY_STATE_ADDRESS: &str = "QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn";

/// Content address encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressEncoding {
    /// CIDv0 / base58btc
    Legacy,
    /// CIDv1
    Modern,
}

/// Immutable content address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Parse and validate a content address.
    ///
    /// Accepts a bare CID or an `/ipfs/<cid>[/...]` path.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let bare = trimmed
            .strip_prefix("/ipfs/")
            .map(|rest| rest.split('/').next().unwrap_or(rest))
            .unwrap_or(trimmed);

        let cid = Cid::try_from(bare)
            .map_err(|e| StrandError::InvalidIdentifier(format!("{}: {}", bare, e)))?;
        if cid.codec() == LIBP2P_KEY_CODEC {
            return Err(StrandError::InvalidIdentifier(format!(
                "{} names a key, not content",
                bare
            )));
        }
        Ok(Self(bare.to_string()))
    }

    /// The well-known empty sentinel
    pub fn empty() -> Self {
        Self(EMPTY_STATE_ADDRESS.to_string())
    }

    pub fn is_empty_sentinel(&self) -> bool {
        self.0 == EMPTY_STATE_ADDRESS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn encoding(&self) -> AddressEncoding {
        match Cid::try_from(self.0.as_str()).map(|c| c.version()) {
            Ok(Version::V0) => AddressEncoding::Legacy,
            Ok(Version::V1) => AddressEncoding::Modern,
            // Prefix heuristics for addresses constructed without validation
            Err(_) if self.0.starts_with("Qm") => AddressEncoding::Legacy,
            Err(_) => AddressEncoding::Modern,
        }
    }

    /// Lowercase CIDv1 form usable as a DNS label.
    ///
    /// Returns `None` when the address cannot be re-encoded.
    pub fn dns_label(&self) -> Option<String> {
        let cid = Cid::try_from(self.0.as_str()).ok()?;
        match cid.version() {
            Version::V1 => Some(cid.to_string().to_lowercase()),
            Version::V0 => cid.into_v1().ok().map(|v1| v1.to_string()),
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentAddress {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A logical identifier: mutable name or immutable address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Identifier {
    Name(String),
    Address(ContentAddress),
}

impl Identifier {
    /// Classify a raw identifier string.
    ///
    /// `/ipns/<name>` and `/ipfs/<cid>` prefixes are honoured.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(StrandError::InvalidIdentifier("empty identifier".into()));
        }
        if let Some(name) = trimmed.strip_prefix("/ipns/") {
            let name = name.split('/').next().unwrap_or(name);
            return Ok(Identifier::Name(name.to_string()));
        }
        match ContentAddress::parse(trimmed) {
            Ok(address) => Ok(Identifier::Address(address)),
            Err(_) if trimmed.starts_with("/ipfs/") => Err(StrandError::InvalidIdentifier(
                trimmed.to_string(),
            )),
            Err(_) => Ok(Identifier::Name(trimmed.to_string())),
        }
    }

    /// String used in gateway URLs and as a backoff key
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Name(name) => name,
            Identifier::Address(address) => address.as_str(),
        }
    }

    pub fn is_name(&self) -> bool {
        matches!(self, Identifier::Name(_))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Name(name) => write!(f, "/ipns/{}", name),
            Identifier::Address(address) => write!(f, "/ipfs/{}", address),
        }
    }
}

impl From<ContentAddress> for Identifier {
    fn from(address: ContentAddress) -> Self {
        Identifier::Address(address)
    }
}

/// Distinct valid CIDv1 (raw, sha2-256 shaped) for tests
#[cfg(test)]
pub(crate) fn test_address(n: u64) -> ContentAddress {
    let mut digest = [0u8; 32];
    digest[..8].copy_from_slice(&n.to_be_bytes());
    let hash = cid::multihash::Multihash::<64>::wrap(0x12, &digest).unwrap();
    ContentAddress::parse(&Cid::new_v1(0x55, hash).to_string()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";
    const IPNS_KEY: &str = "k51qzi5uqu5dlvj2baxnqndepeb86cbk3ng7n3i46uzyxzyqj2xjonzllnv0v8";

    #[test]
    fn test_encodings() {
        let legacy = ContentAddress::parse(EMPTY_STATE_ADDRESS).unwrap();
        assert_eq!(legacy.encoding(), AddressEncoding::Legacy);
        assert!(legacy.is_empty_sentinel());

        let modern = ContentAddress::parse(V1).unwrap();
        assert_eq!(modern.encoding(), AddressEncoding::Modern);
        assert!(!modern.is_empty_sentinel());
    }

    #[test]
    fn test_dns_label_converts_legacy() {
        let legacy = ContentAddress::parse(EMPTY_STATE_ADDRESS).unwrap();
        let label = legacy.dns_label().unwrap();
        assert!(label.starts_with("bafy"));
        assert_eq!(label, label.to_lowercase());

        let modern = ContentAddress::parse(V1).unwrap();
        assert_eq!(modern.dns_label().unwrap(), V1);
    }

    #[test]
    fn test_identifier_classification() {
        assert_eq!(
            Identifier::parse(V1).unwrap(),
            Identifier::Address(ContentAddress::parse(V1).unwrap())
        );
        assert_eq!(
            Identifier::parse(&format!("/ipfs/{}/index.json", V1)).unwrap(),
            Identifier::Address(ContentAddress::parse(V1).unwrap())
        );
        assert_eq!(
            Identifier::parse(IPNS_KEY).unwrap(),
            Identifier::Name(IPNS_KEY.to_string())
        );
        assert_eq!(
            Identifier::parse("/ipns/example.org").unwrap(),
            Identifier::Name("example.org".to_string())
        );
        assert_eq!(
            Identifier::parse("example.org").unwrap(),
            Identifier::Name("example.org".to_string())
        );
        assert!(Identifier::parse("   ").is_err());
        assert!(Identifier::parse("/ipfs/not-a-cid").is_err());
    }

    #[test]
    fn test_synthetic_addresses_are_distinct() {
        assert_ne!(test_address(1), test_address(2));
        assert_eq!(test_address(1).encoding(), AddressEncoding::Modern);
    }

    #[test]
    fn test_key_cid_is_not_an_address() {
        assert!(ContentAddress::parse(IPNS_KEY).is_err());
    }

    #[test]
    fn test_serde_transparent() {
        let address = ContentAddress::parse(V1).unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{}\"", V1));
    }
}
