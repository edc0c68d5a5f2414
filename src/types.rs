//! Core types for the relay.

use crate::error::RelayError;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Namespace every relayed message lives under unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "messages";

/// Crockford base32 alphabet.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Rendered length of an [`EntryId`].
const ID_LEN: usize = 26;

/// Bits of entropy below the millisecond prefix.
const ENTROPY_BITS: u32 = 80;

const ENTROPY_MASK: u128 = (1u128 << ENTROPY_BITS) - 1;

const MAX_MILLIS: u64 = (1u64 << 48) - 1;

/// Time-prefixed, lexicographically sortable entry identifier.
///
/// The top 48 bits hold unix milliseconds and the low 80 bits hold entropy,
/// so numeric order, string order and creation order agree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u128);

impl EntryId {
    pub const MIN: EntryId = EntryId(0);
    pub const MAX: EntryId = EntryId(u128::MAX);

    /// Assemble an id from a millisecond prefix and an entropy suffix.
    pub fn from_parts(millis: u64, entropy: u128) -> Self {
        EntryId(((millis.min(MAX_MILLIS) as u128) << ENTROPY_BITS) | (entropy & ENTROPY_MASK))
    }

    /// Millisecond prefix.
    pub fn millis(&self) -> u64 {
        (self.0 >> ENTROPY_BITS) as u64
    }

    /// Entropy suffix.
    pub fn entropy(&self) -> u128 {
        self.0 & ENTROPY_MASK
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; ID_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 5 * (ID_LEN - 1 - i);
            *slot = ALPHABET[((self.0 >> shift) & 0x1f) as usize];
        }
        // The alphabet is ASCII.
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self)
    }
}

impl FromStr for EntryId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LEN {
            return Err(RelayError::InvalidId(s.to_string()));
        }

        let mut value: u128 = 0;
        for (i, c) in s.bytes().enumerate() {
            let digit = decode_digit(c).ok_or_else(|| RelayError::InvalidId(s.to_string()))?;
            // 26 * 5 = 130 bits, so the leading digit only carries 3.
            if i == 0 && digit > 7 {
                return Err(RelayError::InvalidId(s.to_string()));
            }
            value = (value << 5) | digit as u128;
        }
        Ok(EntryId(value))
    }
}

fn decode_digit(c: u8) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    let c = match c {
        b'I' | b'L' => b'1',
        b'O' => b'0',
        other => other,
    };
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u8)
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Default)]
struct GeneratorState {
    last_millis: u64,
    last_entropy: u128,
    calls: u64,
}

/// Generates strictly increasing [`EntryId`]s.
///
/// Within a single millisecond (or when the clock steps backwards) the
/// previous entropy is incremented rather than redrawn.
#[derive(Default)]
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next id.
    pub fn next_id(&self) -> EntryId {
        let now = Timestamp::now().as_millis();
        let mut state = self.state.lock();
        state.calls += 1;

        let (millis, entropy) = if now > state.last_millis {
            (now, Self::draw_entropy(state.calls))
        } else if state.last_entropy < ENTROPY_MASK {
            (state.last_millis, state.last_entropy + 1)
        } else {
            (state.last_millis + 1, Self::draw_entropy(state.calls))
        };

        state.last_millis = millis;
        state.last_entropy = entropy;
        EntryId::from_parts(millis, entropy)
    }

    fn draw_entropy(calls: u64) -> u128 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(nanos.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(calls.to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes[6..].copy_from_slice(&digest[..10]);
        u128::from_be_bytes(bytes)
    }
}

/// Store key: a namespace tag plus the entry id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub namespace: String,
    pub id: EntryId,
}

impl EntryKey {
    pub fn new(namespace: impl Into<String>, id: EntryId) -> Self {
        Self {
            namespace: namespace.into(),
            id,
        }
    }

    /// Key under the default namespace.
    pub fn message(id: EntryId) -> Self {
        Self::new(DEFAULT_NAMESPACE, id)
    }

    /// Smallest key in a namespace.
    pub fn namespace_start(namespace: &str) -> Self {
        Self::new(namespace, EntryId::MIN)
    }

    /// Largest key in a namespace.
    pub fn namespace_end(namespace: &str) -> Self {
        Self::new(namespace, EntryId::MAX)
    }
}

impl fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryKey({}/{})", self.namespace, self.id)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Opaque version token assigned by the store on every committed write.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Versionstamp(pub u64);

impl Versionstamp {
    pub fn next(self) -> Self {
        Versionstamp(self.0 + 1)
    }

    /// Ten-byte form: big-endian counter followed by two zero bytes.
    pub fn to_bytes(&self) -> [u8; 10] {
        let mut bytes = [0u8; 10];
        bytes[..8].copy_from_slice(&self.0.to_be_bytes());
        bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 10] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&arr[..8]);
        Ok(Versionstamp(u64::from_be_bytes(counter)))
    }
}

impl fmt::Debug for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Versionstamp({})", self.to_hex())
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn as_millis(&self) -> u64 {
        (self.0.max(0) / 1000) as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A pending message as observed from the store or a notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: EntryKey,
    pub value: Vec<u8>,
    pub versionstamp: Versionstamp,
}

/// Result of a conditional delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The versionstamp matched and the entry is gone.
    Committed,
    /// The entry was already deleted or rewritten by someone else.
    Conflict,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub live_entries: u64,
    pub dead_frames: u64,
    pub log_size_bytes: u64,
    pub last_versionstamp: Versionstamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_string_roundtrip() {
        let id = EntryId::from_parts(1_700_000_000_000, 0xDEAD_BEEF);
        let s = id.to_string();
        assert_eq!(s.len(), 26);
        assert_eq!(s.parse::<EntryId>().unwrap(), id);
        assert_eq!(s.to_lowercase().parse::<EntryId>().unwrap(), id);
    }

    #[test]
    fn test_id_rejects_garbage() {
        assert!("short".parse::<EntryId>().is_err());
        assert!("8ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<EntryId>().is_err());
        assert!("0000000000000000000000000U".parse::<EntryId>().is_err());
        assert_eq!(
            "7ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<EntryId>().unwrap(),
            EntryId::MAX
        );
    }

    #[test]
    fn test_id_string_order_matches_numeric_order() {
        let a = EntryId::from_parts(1000, ENTROPY_MASK);
        let b = EntryId::from_parts(1001, 0);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_generator_is_monotonic() {
        let ids = IdGenerator::new();
        let generated: Vec<EntryId> = (0..10_000).map(|_| ids.next_id()).collect();
        for pair in generated.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
            assert!(pair[0].to_string() < pair[1].to_string());
        }
    }

    #[test]
    fn test_generator_prefix_is_current_time() {
        let before = Timestamp::now().as_millis();
        let id = IdGenerator::new().next_id();
        assert!(id.millis() >= before);
    }

    #[test]
    fn test_key_order_groups_namespaces() {
        let ids = IdGenerator::new();
        let late = ids.next_id();
        let a = EntryKey::new("alpha", late);
        let b = EntryKey::new("beta", EntryId::MIN);
        assert!(a < b);
        assert!(EntryKey::namespace_start("alpha") <= a);
        assert!(a <= EntryKey::namespace_end("alpha"));
        assert_eq!(EntryKey::message(late).to_string(), format!("messages/{}", late));
    }

    #[test]
    fn test_versionstamp_hex() {
        let vs = Versionstamp(0x1234);
        assert_eq!(vs.to_hex(), "00000000000012340000");
        assert_eq!(Versionstamp::from_hex(&vs.to_hex()).unwrap(), vs);
        assert!(Versionstamp::from_hex("00").is_err());
    }
}
