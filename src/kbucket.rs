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

//! The Kademlia routing table: 256 k-buckets indexed by the log2 XOR distance from the
//! local node, each holding up to [`MAX_NODES_PER_BUCKET`] entries and a single pending
//! slot used to challenge the least-recently seen occupant on capacity overflow.

mod bucket;
mod entry;
mod key;

pub use bucket::{
    AppliedPending, InsertResult, KBucket, Node, NodeStatus, PendingNode, MAX_NODES_PER_BUCKET,
};
pub use entry::{AbsentEntry, Entry, PendingEntry, PresentEntry};
pub use key::{Distance, Key};

use std::collections::VecDeque;
use std::time::Duration;

/// Number of distance shells, i.e. the number of buckets in the table.
const NUM_BUCKETS: usize = 256;

/// A `KBucketsTable` represents a Kademlia routing table.
pub struct KBucketsTable<TNodeId, TVal> {
    /// The key identifying the local peer that owns the routing table.
    local_key: Key<TNodeId>,

    /// The buckets comprising the routing table.
    buckets: Vec<KBucket<TNodeId, TVal>>,

    /// The list of evicted entries that have been replaced with pending entries. These
    /// entries are drained with `take_applied_pending`.
    applied_pending: VecDeque<AppliedPending<TNodeId, TVal>>,
}

/// An index into the `KBucketsTable.buckets` vector.
#[derive(Copy, Clone, PartialEq, Eq)]
struct BucketIndex(usize);

impl BucketIndex {
    /// Creates a new `BucketIndex` for a `Distance`. The given distance is interpreted
    /// as the distance from the `local_key` of the `KBucketsTable`. `None` for a
    /// distance of 0, i.e. the distance of the local key to itself.
    fn new(d: &Distance) -> Option<BucketIndex> {
        d.0.bits().checked_sub(1).map(BucketIndex)
    }

    /// Gets the index value as an unsigned integer.
    fn get(&self) -> usize {
        self.0
    }
}

impl<TNodeId, TVal> KBucketsTable<TNodeId, TVal>
where
    TNodeId: Clone,
    TVal: Clone,
{
    /// Creates a new, empty routing table with the given local key and timeout for
    /// pending entries.
    pub fn new(local_key: Key<TNodeId>, pending_timeout: Duration) -> Self {
        KBucketsTable {
            local_key,
            buckets: (0..NUM_BUCKETS)
                .map(|_| KBucket::new(pending_timeout))
                .collect(),
            applied_pending: VecDeque::new(),
        }
    }

    /// Returns the local key.
    pub fn local_key(&self) -> &Key<TNodeId> {
        &self.local_key
    }

    /// Returns an `Entry` for the given key, representing the state of the entry in the
    /// routing table.
    pub fn entry<'a>(&'a mut self, key: &'a Key<TNodeId>) -> Entry<'a, TNodeId, TVal> {
        if let Some(index) = BucketIndex::new(&self.local_key.distance(key)) {
            let bucket = &mut self.buckets[index.get()];
            if let Some(applied) = bucket.apply_pending() {
                self.applied_pending.push_back(applied)
            }
            Entry::new(bucket, key)
        } else {
            Entry::SelfEntry
        }
    }

    /// Returns an iterator over all the entries in the routing table.
    pub fn iter(&mut self) -> impl Iterator<Item = &Node<TNodeId, TVal>> {
        let applied_pending = &mut self.applied_pending;
        self.buckets.iter_mut().flat_map(move |table| {
            if let Some(applied) = table.apply_pending() {
                applied_pending.push_back(applied)
            }
            table.iter()
        })
    }

    /// Removes all entries from the routing table.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.applied_pending.clear();
    }

    /// Returns the cloned values of the shell at exactly the given log2 distance, in
    /// bucket order. Distances outside `1..=256` yield no records; distance 0 denotes
    /// the local record, which the table does not store.
    pub fn nodes_by_distance(&mut self, log2_distance: u64) -> Vec<TVal> {
        if log2_distance == 0 || log2_distance > NUM_BUCKETS as u64 {
            return Vec::new();
        }
        let bucket = &mut self.buckets[(log2_distance - 1) as usize];
        if let Some(applied) = bucket.apply_pending() {
            self.applied_pending.push_back(applied)
        }
        bucket.iter().map(|node| node.value.clone()).collect()
    }

    /// Returns the cloned values of all entries, sorted by ascending XOR distance to
    /// `target`. The sort is stable: records at equal distance keep table order.
    pub fn closest_values<U>(&mut self, target: &Key<U>) -> Vec<TVal> {
        let mut nodes = self
            .iter()
            .map(|node| (target.distance(&node.key), node.value.clone()))
            .collect::<Vec<_>>();
        nodes.sort_by_key(|(distance, _)| *distance);
        nodes.into_iter().map(|(_, value)| value).collect()
    }

    /// Returns the keys of all entries, sorted by ascending XOR distance to `target`.
    pub fn closest_keys<U>(&mut self, target: &Key<U>) -> Vec<Key<TNodeId>> {
        let mut keys = self
            .iter()
            .map(|node| (target.distance(&node.key), node.key.clone()))
            .collect::<Vec<_>>();
        keys.sort_by_key(|(distance, _)| *distance);
        keys.into_iter().map(|(_, key)| key).collect()
    }

    /// Consumes the next applied pending entry, if any.
    ///
    /// When an entry is attempted to be inserted and the respective bucket is full,
    /// it may be recorded as pending insertion, pending a certain timeout
    /// during which the least-recently connected (and currently disconnected)
    /// node is given a chance to re-establish its connected status. If the timeout
    /// expires, the pending entry replaces the disconnected node and the eviction is
    /// recorded for consumption by this function.
    pub fn take_applied_pending(&mut self) -> Option<AppliedPending<TNodeId, TVal>> {
        for bucket in &mut self.buckets {
            if let Some(applied) = bucket.apply_pending() {
                self.applied_pending.push_back(applied)
            }
        }
        self.applied_pending.pop_front()
    }
}
