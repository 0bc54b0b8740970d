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

// The basis of this file has been taken from the rust-libp2p codebase:
// https://github.com/libp2p/rust-libp2p

//! All the iterative lookups currently in progress, as a pull-driven pool.
//!
//! The pool is advanced by repeatedly calling [`LookupPool::poll`], which reports
//! lookups that want a peer probed, have finished, or have exceeded the pool-wide
//! timeout. The pool runs no timers; the driver decides when to poll.

mod iterative;

pub use iterative::{IterativeLookup, LookupConfig, LookupState, ProbePeer};

use crate::kbucket::Key;
use fnv::FnvHashMap;
use std::time::{Duration, Instant};

/// Identifier of a lookup.
///
/// Ids are positive, assigned in increasing order and wrap past `u32::MAX` back to 1;
/// 0 is never issued. At any moment all live lookups have distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupId(pub u32);

/// A pool of lookups.
pub struct LookupPool<TTarget, TNodeId> {
    next_id: u32,
    lookup_timeout: Duration,
    lookups: FnvHashMap<LookupId, Lookup<TTarget, TNodeId>>,
}

/// The observable states emitted by [`LookupPool::poll`].
pub enum PoolState<'a, TTarget, TNodeId> {
    /// The pool is idle, i.e. there are no lookups to process.
    Idle,

    /// At least one lookup is waiting for results. `Some(lookup, probe)` indicates that
    /// a probe of `probe` on behalf of the lookup is now expected.
    Waiting(Option<(&'a mut Lookup<TTarget, TNodeId>, ProbePeer<TNodeId>)>),

    /// A lookup has finished.
    Finished(Lookup<TTarget, TNodeId>),

    /// A lookup has timed out.
    Timeout(Lookup<TTarget, TNodeId>),
}

impl<TTarget, TNodeId> LookupPool<TTarget, TNodeId>
where
    TNodeId: Into<Key<TNodeId>> + Eq + Clone,
{
    /// Creates a new pool with the given pool-wide lookup timeout.
    pub fn new(lookup_timeout: Duration) -> Self {
        LookupPool {
            next_id: 0,
            lookup_timeout,
            lookups: Default::default(),
        }
    }

    /// Returns an iterator over the lookups in the pool.
    pub fn iter(&self) -> impl Iterator<Item = &Lookup<TTarget, TNodeId>> {
        self.lookups.values()
    }

    /// Adds a lookup to the pool that iterates towards the closest peers to the target.
    pub fn add_lookup<I>(
        &mut self,
        config: LookupConfig,
        target: TTarget,
        target_key: Key<TNodeId>,
        known_closest_peers: I,
        iterations: usize,
    ) -> LookupId
    where
        I: IntoIterator<Item = Key<TNodeId>>,
    {
        let id = self.next_lookup_id();
        let peer_iterator =
            IterativeLookup::with_config(config, target_key, known_closest_peers, iterations);
        self.lookups.insert(
            id,
            Lookup {
                id,
                started: Instant::now(),
                peer_iterator,
                target,
            },
        );
        id
    }

    /// Returns a mutable reference to a lookup with the given id, if it is in the pool.
    pub fn get_mut(&mut self, id: LookupId) -> Option<&mut Lookup<TTarget, TNodeId>> {
        self.lookups.get_mut(&id)
    }

    /// Polls the pool to observe the next lookup state.
    pub fn poll(&mut self) -> PoolState<'_, TTarget, TNodeId> {
        let now = Instant::now();
        let mut finished = None;
        let mut timed_out = None;
        let mut waiting = None;

        for (&id, lookup) in self.lookups.iter_mut() {
            if now >= lookup.started + self.lookup_timeout {
                timed_out = Some(id);
                break;
            }
            match lookup.peer_iterator.next(now) {
                LookupState::Finished => {
                    finished = Some(id);
                    break;
                }
                LookupState::Waiting(Some(probe)) => {
                    waiting = Some((id, probe));
                    break;
                }
                LookupState::Waiting(None) | LookupState::WaitingAtCapacity => {}
            }
        }

        if let Some((id, probe)) = waiting {
            let lookup = self.lookups.get_mut(&id).expect("Lookup exists in the pool");
            return PoolState::Waiting(Some((lookup, probe)));
        }

        if let Some(id) = finished {
            let lookup = self.lookups.remove(&id).expect("Lookup exists in the pool");
            return PoolState::Finished(lookup);
        }

        if let Some(id) = timed_out {
            let lookup = self.lookups.remove(&id).expect("Lookup exists in the pool");
            return PoolState::Timeout(lookup);
        }

        if self.lookups.is_empty() {
            PoolState::Idle
        } else {
            PoolState::Waiting(None)
        }
    }

    /// Removes all lookups from the pool. No further events are emitted for them.
    pub fn clear(&mut self) {
        self.lookups.clear();
    }

    fn next_lookup_id(&mut self) -> LookupId {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        LookupId(self.next_id)
    }
}

/// A lookup in the pool.
pub struct Lookup<TTarget, TNodeId> {
    /// The unique id of the lookup.
    id: LookupId,

    /// The instant the lookup was added to the pool.
    started: Instant,

    /// The peer selection state machine of the lookup.
    peer_iterator: IterativeLookup<TNodeId>,

    /// The opaque target of the lookup.
    target: TTarget,
}

impl<TTarget, TNodeId> Lookup<TTarget, TNodeId>
where
    TNodeId: Into<Key<TNodeId>> + Eq + Clone,
{
    pub fn id(&self) -> LookupId {
        self.id
    }

    /// Callback for delivering the result of a successful probe of a peer.
    pub fn on_success(&mut self, peer: &TNodeId, new_peers: &[TNodeId]) {
        self.peer_iterator.on_success(peer, new_peers)
    }

    /// Callback for informing the lookup about a failed probe of a peer.
    pub fn on_failure(&mut self, peer: &TNodeId) {
        self.peer_iterator.on_failure(peer)
    }

    /// Returns a reference to the target of the lookup.
    pub fn target(&self) -> &TTarget {
        &self.target
    }

    /// Returns a mutable reference to the target of the lookup.
    pub fn target_mut(&mut self) -> &mut TTarget {
        &mut self.target
    }

    /// Consumes the lookup, producing its target and the closest peers that delivered
    /// results, by ascending distance.
    pub fn into_result(self) -> (TTarget, Vec<TNodeId>) {
        (self.target, self.peer_iterator.into_result())
    }
}
