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

//! The `Entry` API for querying and modifying the nodes of a single bucket,
//! while enforcing the table-wide uniqueness of keys.

use super::bucket::{InsertResult, KBucket, Node, NodeStatus};
use super::key::Key;

/// A reference into a bucket, scoped to a single key.
pub(super) struct EntryRef<'a, TNodeId, TVal> {
    bucket: &'a mut KBucket<TNodeId, TVal>,
    key: &'a Key<TNodeId>,
}

/// A reference into a single entry of a routing table bucket.
pub enum Entry<'a, TNodeId, TVal> {
    /// The entry is present in a bucket.
    Present(PresentEntry<'a, TNodeId, TVal>, NodeStatus),
    /// The entry is pending insertion in a bucket.
    Pending(PendingEntry<'a, TNodeId, TVal>, NodeStatus),
    /// The entry is absent and may be inserted.
    Absent(AbsentEntry<'a, TNodeId, TVal>),
    /// The entry represents the local node.
    SelfEntry,
}

impl<'a, TNodeId, TVal> Entry<'a, TNodeId, TVal>
where
    TNodeId: Clone,
    TVal: Clone,
{
    /// Creates a new `Entry` for a `Key`, encapsulating access to a bucket.
    pub(super) fn new(bucket: &'a mut KBucket<TNodeId, TVal>, key: &'a Key<TNodeId>) -> Self {
        if let Some(status) = bucket.get(key).map(|node| node.status) {
            Entry::Present(PresentEntry::new(bucket, key), status)
        } else if let Some(status) = bucket.as_pending(key).map(|pending| pending.status()) {
            Entry::Pending(PendingEntry::new(bucket, key), status)
        } else {
            Entry::Absent(AbsentEntry::new(bucket, key))
        }
    }
}

/// An entry present in a bucket.
pub struct PresentEntry<'a, TNodeId, TVal>(EntryRef<'a, TNodeId, TVal>);

impl<'a, TNodeId, TVal> PresentEntry<'a, TNodeId, TVal>
where
    TNodeId: Clone,
    TVal: Clone,
{
    fn new(bucket: &'a mut KBucket<TNodeId, TVal>, key: &'a Key<TNodeId>) -> Self {
        PresentEntry(EntryRef { bucket, key })
    }

    /// Returns a mutable reference to the value of the entry.
    pub fn value(&mut self) -> &mut TVal {
        &mut self
            .0
            .bucket
            .get_mut(self.0.key)
            .expect("Entry is present")
            .value
    }

    /// Sets the status of the entry, re-ordering it within its bucket.
    pub fn update(self, status: NodeStatus) {
        self.0.bucket.update(self.0.key, status);
    }
}

/// An entry waiting in the pending slot of a bucket.
pub struct PendingEntry<'a, TNodeId, TVal>(EntryRef<'a, TNodeId, TVal>);

impl<'a, TNodeId, TVal> PendingEntry<'a, TNodeId, TVal>
where
    TNodeId: Clone,
    TVal: Clone,
{
    fn new(bucket: &'a mut KBucket<TNodeId, TVal>, key: &'a Key<TNodeId>) -> Self {
        PendingEntry(EntryRef { bucket, key })
    }

    /// Returns a mutable reference to the value of the entry.
    pub fn value(&mut self) -> &mut TVal {
        self.0
            .bucket
            .pending_mut()
            .filter(|p| p.key() == self.0.key)
            .expect("Entry is pending")
            .value_mut()
    }

    /// Sets the status of the pending entry.
    pub fn update(self, status: NodeStatus) {
        self.0.bucket.update_pending(status);
    }
}

/// An entry that is not present in any bucket.
pub struct AbsentEntry<'a, TNodeId, TVal>(EntryRef<'a, TNodeId, TVal>);

impl<'a, TNodeId, TVal> AbsentEntry<'a, TNodeId, TVal>
where
    TNodeId: Clone,
    TVal: Clone,
{
    fn new(bucket: &'a mut KBucket<TNodeId, TVal>, key: &'a Key<TNodeId>) -> Self {
        AbsentEntry(EntryRef { bucket, key })
    }

    /// Attempts to insert the entry into its bucket.
    pub fn insert(self, value: TVal, status: NodeStatus) -> InsertResult<TNodeId> {
        self.0.bucket.insert(Node {
            key: self.0.key.clone(),
            value,
            status,
        })
    }
}
