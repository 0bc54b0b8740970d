// Copyright 2019 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

// This basis of this file has been taken from the rust-libp2p codebase:
// https://github.com/libp2p/rust-libp2p

use crate::Enr;
use enr::NodeId;
use uint::construct_uint;

construct_uint! {
    /// 256-bit unsigned integer.
    pub(super) struct U256(4);
}

/// A `Key` in the DHT keyspace with preserved preimage.
///
/// Keys in the keyspace are 256 bits, compared by the XOR metric. A node identifier is
/// already a uniformly distributed 256-bit value and maps into the keyspace unchanged.
#[derive(Clone, Debug)]
pub struct Key<T> {
    preimage: T,
    hash: [u8; 32],
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Key<T>) -> bool {
        self.hash == other.hash
    }
}

impl<T> Eq for Key<T> {}

impl<T> Key<T> {
    /// Constructs a new `Key` from a preimage and its precomputed keyspace position.
    pub fn new_raw(preimage: T, hash: [u8; 32]) -> Key<T> {
        Key { preimage, hash }
    }

    /// Borrows the preimage of the key.
    pub fn preimage(&self) -> &T {
        &self.preimage
    }

    /// Converts the key into its preimage.
    pub fn into_preimage(self) -> T {
        self.preimage
    }

    /// Computes the distance of the keys according to the XOR metric.
    pub fn distance<U>(&self, other: &Key<U>) -> Distance {
        let a = U256::from_big_endian(&self.hash);
        let b = U256::from_big_endian(&other.hash);
        Distance(a ^ b)
    }

    /// Computes the integer log-2 distance between two keys, i.e. the position of the
    /// highest-order 1-bit of their XOR distance, counted from 1. `None` if the keys are
    /// identical.
    pub fn log2_distance<U>(&self, other: &Key<U>) -> Option<u64> {
        let bits = self.distance(other).0.bits();
        if bits == 0 {
            None
        } else {
            Some(bits as u64)
        }
    }
}

impl From<NodeId> for Key<NodeId> {
    fn from(node_id: NodeId) -> Self {
        Key {
            hash: node_id.raw(),
            preimage: node_id,
        }
    }
}

impl From<Enr> for Key<NodeId> {
    fn from(enr: Enr) -> Self {
        enr.node_id().into()
    }
}

/// A distance between two `Key`s.
#[derive(Copy, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Debug)]
pub struct Distance(pub(super) U256);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_keys_have_no_log2_distance() {
        let node_id = NodeId::random();
        let a: Key<NodeId> = node_id.into();
        let b: Key<NodeId> = node_id.into();
        assert_eq!(a.log2_distance(&b), None);
        assert_eq!(a.distance(&b), Distance::default());
    }

    #[test]
    fn log2_distance_is_the_highest_differing_bit() {
        let zero: Key<NodeId> = NodeId::new(&[0u8; 32]).into();

        let mut raw = [0u8; 32];
        raw[31] = 1;
        let one: Key<NodeId> = NodeId::new(&raw).into();
        assert_eq!(zero.log2_distance(&one), Some(1));

        let mut raw = [0u8; 32];
        raw[0] = 0x80;
        let top: Key<NodeId> = NodeId::new(&raw).into();
        assert_eq!(zero.log2_distance(&top), Some(256));

        let mut raw = [0u8; 32];
        raw[10] = 1;
        let mid: Key<NodeId> = NodeId::new(&raw).into();
        assert_eq!(zero.log2_distance(&mid), Some(169));
    }

    #[test]
    fn distance_is_symmetric() {
        let a: Key<NodeId> = NodeId::random().into();
        let b: Key<NodeId> = NodeId::random().into();
        assert_eq!(a.distance(&b), b.distance(&a));
    }
}
