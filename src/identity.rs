//! Node identifiers, the XOR metric and peer records.
//!
//! A [`NodeId`] is a 160-bit identifier. Distance between two ids is their
//! bitwise XOR interpreted as a big-endian integer; the routing table places
//! a peer in the bucket numbered by the length of the prefix it shares with
//! the local id.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Length of a node id in bytes.
pub const ID_LEN: usize = 20;

/// Length of a node id in bits; also the number of routing buckets.
pub const ID_BITS: usize = ID_LEN * 8;

/// XOR distance between two ids.
pub type Distance = [u8; ID_LEN];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// A fresh id drawn from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        if getrandom::getrandom(&mut bytes).is_err() {
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut bytes);
        }
        Self(bytes)
    }

    /// Deterministic id derived from arbitrary seed material (first 160 bits
    /// of its BLAKE3 hash). Used for configured endpoints that carry no id.
    pub fn derive(seed: &[u8]) -> Self {
        let digest = blake3::hash(seed);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Self(bytes)
    }

    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits shared with `other`; `ID_BITS` when equal.
    pub fn shared_prefix_len(&self, other: &NodeId) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First eight bytes in hex, the form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Top eight bits: one of 256 coarse regions of the id space.
    pub fn region(&self) -> u8 {
        self.0[0]
    }
}

pub fn distance_cmp(a: &Distance, b: &Distance) -> std::cmp::Ordering {
    for i in 0..ID_LEN {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

/// A random id whose shared prefix with `local` is exactly `bucket_idx` bits.
///
/// `bucket_idx` must be below `ID_BITS`; larger values are clamped to the
/// deepest bucket.
pub fn random_id_in_bucket(local: &NodeId, bucket_idx: usize) -> NodeId {
    let shared = bucket_idx.min(ID_BITS - 1);
    let (whole, rem) = (shared / 8, shared % 8);
    let local = local.as_bytes();
    let mut bytes = NodeId::random().0;

    bytes[..whole].copy_from_slice(&local[..whole]);
    let keep = !(0xffu8 >> rem);
    let flip = 0x80u8 >> rem;
    bytes[whole] = (local[whole] & keep) | (!local[whole] & flip) | (bytes[whole] & (flip - 1));
    NodeId(bytes)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

// ============================================================================
// Roles, tiers and capability filters
// ============================================================================

/// Duty a peer can take in the key-agreement protocol built on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SpinGenerator,
    BaseGenerator,
    Polarizer,
    Meter,
    Collider,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::SpinGenerator,
        Role::BaseGenerator,
        Role::Polarizer,
        Role::Meter,
        Role::Collider,
    ];

    fn bit(self) -> u8 {
        match self {
            Role::SpinGenerator => 1 << 0,
            Role::BaseGenerator => 1 << 1,
            Role::Polarizer => 1 << 2,
            Role::Meter => 1 << 3,
            Role::Collider => 1 << 4,
        }
    }
}

/// Compact set of [`Role`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RoleSet(u8);

impl RoleSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Role::ALL.iter().copied().collect()
    }

    pub fn with(mut self, role: Role) -> Self {
        self.insert(role);
        self
    }

    pub fn insert(&mut self, role: Role) {
        self.0 |= role.bit();
    }

    pub fn remove(&mut self, role: Role) {
        self.0 &= !role.bit();
    }

    pub fn contains(&self, role: Role) -> bool {
        self.0 & role.bit() != 0
    }

    /// True when every role in `other` is also in `self`.
    pub fn contains_all(&self, other: RoleSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: RoleSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        let mut set = RoleSet::empty();
        for role in iter {
            set.insert(role);
        }
        set
    }
}

impl std::fmt::Debug for RoleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Position of a peer in the deployment hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerTier {
    Super,
    Regional,
    Local,
    Worker,
}

/// Structural match on roles and tier. An empty role set and no tier
/// matches every peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFilter {
    pub roles: RoleSet,
    pub tier: Option<PeerTier>,
}

impl CapabilityFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_roles(roles: RoleSet) -> Self {
        Self { roles, tier: None }
    }

    pub fn matches(&self, peer: &PeerRecord) -> bool {
        if !peer.roles.contains_all(self.roles) {
            return false;
        }
        match self.tier {
            Some(tier) => peer.tier == Some(tier),
            None => true,
        }
    }
}

// ============================================================================
// Peer records
// ============================================================================

/// Health as last reported by the health monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PeerHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// What the overlay knows about a remote peer.
///
/// `bucket_index` is assigned by the routing table on insertion and always
/// equals the shared prefix length with the local id.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub last_seen: Instant,
    /// Last time this peer answered us directly. `None` for contacts only
    /// learned second-hand.
    pub last_verified: Option<Instant>,
    pub health: PeerHealth,
    pub bucket_index: usize,
    pub tier: Option<PeerTier>,
    pub roles: RoleSet,
}

impl PeerRecord {
    pub fn new(id: NodeId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
            last_seen: Instant::now(),
            last_verified: None,
            health: PeerHealth::Unknown,
            bucket_index: 0,
            tier: None,
            roles: RoleSet::empty(),
        }
    }

    pub fn with_tier(mut self, tier: PeerTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_roles(mut self, roles: RoleSet) -> Self {
        self.roles = roles;
        self
    }

    /// Mark as verified by a direct exchange just now.
    pub fn verified(mut self) -> Self {
        let now = Instant::now();
        self.last_seen = now;
        self.last_verified = Some(now);
        self
    }

    /// Strip locally-observed state, as when a record arrives from a remote
    /// peer's `find_node` answer.
    pub fn learned(mut self) -> Self {
        self.last_seen = Instant::now();
        self.last_verified = None;
        self.health = PeerHealth::Unknown;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Verified within `window` of now.
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.last_verified.is_some_and(|t| t.elapsed() <= window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = b;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn shared_prefix_of_equal_ids_is_full_width() {
        let a = NodeId::random();
        assert_eq!(a.shared_prefix_len(&a), ID_BITS);
    }

    #[test]
    fn shared_prefix_counts_leading_equal_bits() {
        let zero = NodeId::from_bytes([0u8; ID_LEN]);
        assert_eq!(zero.shared_prefix_len(&id_with_first_byte(0x80)), 0);
        assert_eq!(zero.shared_prefix_len(&id_with_first_byte(0x01)), 7);

        let mut bytes = [0u8; ID_LEN];
        bytes[2] = 0x20;
        assert_eq!(zero.shared_prefix_len(&NodeId::from_bytes(bytes)), 18);
    }

    #[test]
    fn random_id_in_bucket_lands_in_requested_bucket() {
        let local = NodeId::random();
        for bucket in [0, 1, 7, 8, 63, 100, ID_BITS - 1] {
            for _ in 0..8 {
                let id = random_id_in_bucket(&local, bucket);
                assert_eq!(local.shared_prefix_len(&id), bucket);
            }
        }
    }

    #[test]
    fn distance_ordering_is_big_endian() {
        let zero = NodeId::from_bytes([0u8; ID_LEN]);
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        assert_eq!(
            distance_cmp(&zero.xor_distance(&near), &zero.xor_distance(&far)),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn hex_round_trip_and_length_check() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(NodeId::derive(b"10.0.0.1:7000"), NodeId::derive(b"10.0.0.1:7000"));
        assert_ne!(NodeId::derive(b"10.0.0.1:7000"), NodeId::derive(b"10.0.0.2:7000"));
    }

    #[test]
    fn capability_filter_requires_all_roles_and_tier() {
        let peer = PeerRecord::new(NodeId::random(), "127.0.0.1", 9000)
            .with_roles(RoleSet::empty().with(Role::Meter).with(Role::Collider))
            .with_tier(PeerTier::Worker);

        assert!(CapabilityFilter::any().matches(&peer));
        assert!(CapabilityFilter::with_roles(RoleSet::empty().with(Role::Meter)).matches(&peer));
        assert!(!CapabilityFilter::with_roles(RoleSet::empty().with(Role::Polarizer)).matches(&peer));

        let super_only = CapabilityFilter {
            roles: RoleSet::empty(),
            tier: Some(PeerTier::Super),
        };
        assert!(!super_only.matches(&peer));
    }

    #[test]
    fn learned_records_drop_verification() {
        let peer = PeerRecord::new(NodeId::random(), "127.0.0.1", 9000).verified();
        assert!(peer.is_fresh(Duration::from_secs(1)));
        let learned = peer.learned();
        assert!(learned.last_verified.is_none());
        assert!(!learned.is_fresh(Duration::from_secs(60)));
    }
}
