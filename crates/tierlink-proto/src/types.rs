//! Identifiers shared by every message.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of a stored block.
pub type BlockId = u64;

/// Identifier the coordinator assigns to a worker.
pub type WorkerId = u64;

/// Identifies one call on a multiplexed connection.
///
/// Stored as the 16 raw bytes of a ULID and printed in its 26-character
/// Crockford form.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(compare(PartialEq))]
pub struct CorrelationId(pub [u8; 16]);

impl CorrelationId {
    #[must_use]
    pub fn new() -> Self {
        Ulid::new().into()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Ulid> for CorrelationId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid.to_bytes())
    }
}

impl From<CorrelationId> for Ulid {
    fn from(id: CorrelationId) -> Self {
        Self::from_bytes(id.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ulid::from(*self))
    }
}

/// Identity of a block location on a worker.
///
/// Two storage directories with the same tier alias and medium type are the
/// same location; directory paths never take part in the identity.
#[derive(
    Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct BlockStoreLocation {
    /// Tier alias, e.g. `MEM` or `SSD`.
    pub tier_alias: String,
    /// Medium type within the tier.
    pub medium_type: String,
}

impl BlockStoreLocation {
    /// Creates a location key.
    #[must_use]
    pub fn new(tier_alias: impl Into<String>, medium_type: impl Into<String>) -> Self {
        Self {
            tier_alias: tier_alias.into(),
            medium_type: medium_type.into(),
        }
    }
}

impl fmt::Display for BlockStoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier_alias, self.medium_type)
    }
}
