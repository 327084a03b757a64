//! Fixed-width identifiers and the XOR distance metric.
//!
//! Node IDs and keys share one 160-bit, big-endian coordinate space. Every
//! arithmetic operation here is total over that width: addition and
//! subtraction wrap, shifts drop bits off the low end.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, BitXor, Shr, Sub};

use iroh_blake3::Hasher;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Width of an identifier in bytes.
pub const ID_BYTES: usize = 20;

/// Width of an identifier in bits.
pub const ID_BITS: usize = ID_BYTES * 8;

/// A 160-bit unsigned integer stored big-endian.
///
/// Used both as a node identifier and as a key. The derived ordering is
/// lexicographic over the bytes, which for a big-endian layout is numeric
/// ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zero identifier.
    pub const MIN: NodeId = NodeId([0x00; ID_BYTES]);

    /// The all-one identifier.
    pub const MAX: NodeId = NodeId([0xff; ID_BYTES]);

    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Build an identifier whose low 64 bits hold `value`.
    pub fn from_u64(value: u64) -> Self {
        let mut out = [0u8; ID_BYTES];
        out[ID_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        Self(out)
    }

    /// Derive an identifier from arbitrary bytes.
    ///
    /// Takes the leading 160 bits of a BLAKE3 digest, so identifiers are
    /// spread uniformly over the key space:
    ///
    /// ```
    /// use kad_dht::NodeId;
    ///
    /// let a = NodeId::hash(b"127.0.0.1:4000");
    /// assert_eq!(a, NodeId::hash(b"127.0.0.1:4000"));
    /// assert_ne!(a, NodeId::hash(b"127.0.0.1:4001"));
    /// ```
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        let digest = hasher.finalize();

        let mut out = [0u8; ID_BYTES];
        out.copy_from_slice(&digest.as_bytes()[..ID_BYTES]);
        Self(out)
    }

    /// Draw a uniformly random identifier.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut out = [0u8; ID_BYTES];
        rng.fill_bytes(&mut out);
        Self(out)
    }

    /// Draw a uniformly random identifier from the inclusive range `[low, high]`.
    ///
    /// Bucket ranges produced by the routing table are aligned prefixes, so
    /// the draw keeps the shared prefix and randomises the free suffix.
    pub fn random_in_range<R: RngCore + ?Sized>(rng: &mut R, low: &NodeId, high: &NodeId) -> Self {
        let free = *low ^ *high;
        let noise = NodeId::random(rng);
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = (low.0[i] & !free.0[i]) | (noise.0[i] & free.0[i]);
        }
        let candidate = NodeId(out);
        if candidate < *low || candidate > *high {
            return *low;
        }
        candidate
    }

    /// XOR distance to `other`.
    ///
    /// # Properties
    /// - `a.distance(&a) == NodeId::MIN`
    /// - `a.distance(&b) == b.distance(&a)`
    pub fn distance(&self, other: &NodeId) -> NodeId {
        *self ^ *other
    }

    /// Compare `a` and `b` by their distance to `self`.
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> u32 {
        let mut total = 0;
        for byte in self.0 {
            if byte != 0 {
                return total + byte.leading_zeros();
            }
            total += 8;
        }
        total
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] ^ rhs.0[i];
        }
        NodeId(out)
    }
}

impl Add for NodeId {
    type Output = NodeId;

    /// Wrapping addition.
    fn add(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        let mut carry = 0u16;
        for i in (0..ID_BYTES).rev() {
            let v = self.0[i] as u16 + rhs.0[i] as u16 + carry;
            out[i] = (v & 0xff) as u8;
            carry = v >> 8;
        }
        NodeId(out)
    }
}

impl Add<u32> for NodeId {
    type Output = NodeId;

    fn add(self, rhs: u32) -> NodeId {
        self + NodeId::from_u64(rhs as u64)
    }
}

impl Sub for NodeId {
    type Output = NodeId;

    /// Wrapping subtraction. Callers only subtract a smaller bound from a
    /// larger one.
    fn sub(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        let mut borrow = 0i16;
        for i in (0..ID_BYTES).rev() {
            let mut v = self.0[i] as i16 - rhs.0[i] as i16 - borrow;
            if v < 0 {
                v += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = v as u8;
        }
        NodeId(out)
    }
}

impl Shr<u32> for NodeId {
    type Output = NodeId;

    fn shr(self, bits: u32) -> NodeId {
        if bits as usize >= ID_BITS {
            return NodeId::MIN;
        }
        let bytes = (bits / 8) as usize;
        let rem = bits % 8;
        let mut out = [0u8; ID_BYTES];
        for i in (bytes..ID_BYTES).rev() {
            let src = i - bytes;
            let mut v = self.0[src] >> rem;
            if rem > 0 && src > 0 {
                v |= self.0[src - 1] << (8 - rem);
            }
            out[i] = v;
        }
        NodeId(out)
    }
}

impl From<[u8; ID_BYTES]> for NodeId {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..4]))
    }
}
