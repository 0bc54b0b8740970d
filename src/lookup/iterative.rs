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

//! The iterative traversal state machine of a single lookup.
//!
//! The machine is pure: it is advanced by calling [`IterativeLookup::next`] to obtain
//! peers to probe, and fed with [`IterativeLookup::on_success`] and
//! [`IterativeLookup::on_failure`] as probe results arrive. It runs no timers of its
//! own; `next` takes the current instant.

use crate::config::Config;
use crate::kbucket::{Distance, Key, MAX_NODES_PER_BUCKET};
use std::{
    collections::btree_map::{BTreeMap, Entry},
    time::{Duration, Instant},
};

/// Configuration for an [`IterativeLookup`].
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Allowed level of parallelism.
    ///
    /// The `α` parameter in the Kademlia paper. The maximum number of peers that the
    /// lookup is allowed to wait for in parallel while iterating towards the closest
    /// nodes to the target. Defaults to `3`.
    pub parallelism: usize,

    /// Number of results to produce.
    ///
    /// The number of closest peers that the lookup must obtain successful results
    /// for before it terminates. Defaults to the maximum number of entries in a
    /// single k-bucket, i.e. the `k` parameter in the Kademlia paper.
    pub num_results: usize,

    /// The timeout for a single peer.
    ///
    /// If a successful result is not reported for a peer within this timeout window,
    /// the peer is considered unresponsive and will not be waited for when evaluating
    /// the termination conditions, until and unless a result is delivered.
    pub peer_timeout: Duration,
}

impl LookupConfig {
    pub fn new_from_config(config: &Config) -> Self {
        Self {
            parallelism: config.lookup_parallelism,
            num_results: config.lookup_num_results.min(MAX_NODES_PER_BUCKET),
            peer_timeout: config.lookup_peer_timeout,
        }
    }
}

/// A peer the driver should probe next, together with the probe's per-peer iteration,
/// counted from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePeer<TNodeId> {
    pub node_id: TNodeId,
    pub iteration: usize,
}

/// The state reported by [`IterativeLookup::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupState<TNodeId> {
    /// The lookup is waiting for results.
    ///
    /// `Some(peer)` indicates that a probe should now be sent to the given peer, in
    /// addition to any probes already in flight.
    ///
    /// `None` indicates that the lookup is waiting for results and there is no new peer
    /// to contact, despite the lookup not being at capacity w.r.t. the permitted
    /// parallelism.
    Waiting(Option<ProbePeer<TNodeId>>),

    /// The lookup is waiting for results and is at capacity w.r.t. the permitted
    /// parallelism.
    WaitingAtCapacity,

    /// The lookup finished.
    Finished,
}

pub struct IterativeLookup<TNodeId> {
    /// The target key we are looking for.
    target_key: Key<TNodeId>,

    /// The current state of progress of the lookup.
    progress: Progress,

    /// The closest peers to the target, ordered by increasing distance.
    closest_peers: BTreeMap<Distance, LookupPeer<TNodeId>>,

    /// The number of peers for which the lookup is currently waiting for results.
    num_waiting: usize,

    /// The number of times each peer may be probed before it is considered done.
    iterations: usize,

    /// The configuration of the lookup.
    config: LookupConfig,
}

impl<TNodeId> IterativeLookup<TNodeId>
where
    TNodeId: Into<Key<TNodeId>> + Eq + Clone,
{
    /// Creates a new lookup with the given configuration, seeded with the closest peers
    /// currently known.
    pub fn with_config<I>(
        config: LookupConfig,
        target_key: Key<TNodeId>,
        known_closest_peers: I,
        iterations: usize,
    ) -> Self
    where
        I: IntoIterator<Item = Key<TNodeId>>,
    {
        // Initialise the closest peers to begin the lookup with.
        let closest_peers = known_closest_peers
            .into_iter()
            .map(|key| {
                let distance = key.distance(&target_key);
                (distance, LookupPeer::new(key))
            })
            .take(config.num_results)
            .collect();

        // The lookup initially makes progress by iterating towards the target.
        let progress = Progress::Iterating { no_progress: 0 };

        IterativeLookup {
            target_key,
            progress,
            closest_peers,
            num_waiting: 0,
            iterations: iterations.max(1),
            config,
        }
    }

    /// Callback for delivering the result of a successful probe of a peer that the
    /// lookup is waiting on.
    ///
    /// The lookup is said to make progress either when the given `closer_peers` contain
    /// a peer closer to the target than any peer seen so far, or when the lookup did not
    /// yet accumulate `num_results` closest peers and `closer_peers` contains a new
    /// peer, regardless of its distance to the target.
    ///
    /// If the lookup is finished, is not currently waiting for a result from `peer`, or
    /// a result for `peer` has already been reported, calling this function has no
    /// effect.
    pub fn on_success(&mut self, peer: &TNodeId, closer_peers: &[TNodeId]) {
        if let Progress::Finished = self.progress {
            return;
        }

        let key: Key<TNodeId> = peer.clone().into();
        let distance = key.distance(&self.target_key);

        match self.closest_peers.entry(distance) {
            Entry::Vacant(..) => return,
            Entry::Occupied(mut e) => match e.get().state {
                PeerState::Waiting(..) => {
                    debug_assert!(self.num_waiting > 0);
                    self.num_waiting -= 1;
                    let peer = e.get_mut();
                    peer.peers_returned += closer_peers.len();
                    if peer.iteration < self.iterations {
                        // The peer is probed again, at an adjacent distance.
                        peer.iteration += 1;
                        peer.state = PeerState::NotContacted;
                    } else {
                        peer.state = PeerState::Succeeded;
                    }
                }
                PeerState::Unresponsive => {
                    let peer = e.get_mut();
                    peer.peers_returned += closer_peers.len();
                    if peer.iteration < self.iterations {
                        peer.iteration += 1;
                        peer.state = PeerState::NotContacted;
                    } else {
                        peer.state = PeerState::Succeeded;
                    }
                }
                PeerState::NotContacted | PeerState::Failed | PeerState::Succeeded => return,
            },
        }

        let mut progress = false;
        let num_closest = self.closest_peers.len();

        // Incorporate the reported closer peers into the lookup. Peers already known
        // keep their existing state; the distance key deduplicates newcomers.
        for new_peer in closer_peers {
            let key: Key<TNodeId> = new_peer.clone().into();
            let distance = self.target_key.distance(&key);
            self.closest_peers
                .entry(distance)
                .or_insert_with(|| LookupPeer::new(key));
            progress = self.closest_peers.keys().next() == Some(&distance)
                || num_closest < self.config.num_results;
        }

        // Update the lookup progress.
        self.progress = match self.progress {
            Progress::Iterating { no_progress } => {
                let no_progress = if progress { 0 } else { no_progress + 1 };
                if no_progress >= self.config.parallelism {
                    Progress::Stalled
                } else {
                    Progress::Iterating { no_progress }
                }
            }
            Progress::Stalled => {
                if progress {
                    Progress::Iterating { no_progress: 0 }
                } else {
                    Progress::Stalled
                }
            }
            Progress::Finished => Progress::Finished,
        }
    }

    /// Callback for informing the lookup about a failed probe of a peer that the lookup
    /// is waiting on.
    ///
    /// If the lookup is finished, is not currently waiting for a result from `peer`, or
    /// a result for `peer` has already been reported, calling this function has no
    /// effect.
    pub fn on_failure(&mut self, peer: &TNodeId) {
        if let Progress::Finished = self.progress {
            return;
        }

        let key: Key<TNodeId> = peer.clone().into();
        let distance = key.distance(&self.target_key);

        if let Entry::Occupied(mut e) = self.closest_peers.entry(distance) {
            if let PeerState::Waiting(..) = e.get().state {
                debug_assert!(self.num_waiting > 0);
                self.num_waiting -= 1;
                e.get_mut().state = PeerState::Failed
            }
        }
    }

    /// Advances the state of the lookup, potentially getting a new peer to probe.
    pub fn next(&mut self, now: Instant) -> LookupState<TNodeId> {
        if let Progress::Finished = self.progress {
            return LookupState::Finished;
        }

        // Count the number of peers that returned a result. If there is a probe in
        // progress to one of the `num_results` closest peers, the counter is set to
        // `None` as the lookup can only finish once `num_results` closest peers have
        // responded (or there are no more peers to probe).
        let mut result_counter = Some(0);

        // Check if the lookup is at capacity w.r.t. the allowed parallelism.
        let at_capacity = self.at_capacity();

        for peer in self.closest_peers.values_mut() {
            match peer.state {
                PeerState::NotContacted => {
                    if !at_capacity {
                        let timeout = now + self.config.peer_timeout;
                        peer.state = PeerState::Waiting(timeout);
                        self.num_waiting += 1;
                        return LookupState::Waiting(Some(ProbePeer {
                            node_id: peer.key.preimage().clone(),
                            iteration: peer.iteration,
                        }));
                    } else {
                        return LookupState::WaitingAtCapacity;
                    }
                }

                PeerState::Waiting(timeout) => {
                    if now >= timeout {
                        // Peers that don't respond within timeout are set to `Unresponsive`.
                        debug_assert!(self.num_waiting > 0);
                        self.num_waiting -= 1;
                        peer.state = PeerState::Unresponsive;
                    } else if at_capacity {
                        // The lookup is still waiting for a result from a peer and is
                        // at capacity w.r.t. the maximum number of peers being waited on.
                        return LookupState::WaitingAtCapacity;
                    } else {
                        // The lookup is still waiting for a result from a peer and the
                        // `result_counter` did not yet reach `num_results`. Therefore
                        // the lookup is not yet done, regardless of already successful
                        // probes of peers farther from the target.
                        result_counter = None;
                    }
                }

                PeerState::Succeeded => {
                    if let Some(ref mut cnt) = result_counter {
                        *cnt += 1;
                        // If `num_results` successful results have been delivered for the
                        // closest peers, the lookup is done.
                        if *cnt >= self.config.num_results {
                            self.progress = Progress::Finished;
                            return LookupState::Finished;
                        }
                    }
                }

                PeerState::Failed | PeerState::Unresponsive => {
                    // Skip over unresponsive or failed peers.
                }
            }
        }

        if self.num_waiting > 0 {
            // The lookup is still waiting for results and not at capacity w.r.t.
            // the allowed parallelism, but there are no new peers to probe
            // at the moment.
            LookupState::Waiting(None)
        } else {
            // The lookup is finished because all available peers have been probed and
            // the lookup is not waiting for any more results.
            self.progress = Progress::Finished;
            LookupState::Finished
        }
    }

    /// Consumes the lookup, returning the closest peers that delivered results, by
    /// ascending distance to the target.
    pub fn into_result(self) -> Vec<TNodeId> {
        self.closest_peers
            .into_iter()
            .filter_map(|(_, peer)| {
                if let PeerState::Succeeded = peer.state {
                    Some(peer.key.into_preimage())
                } else {
                    None
                }
            })
            .take(self.config.num_results)
            .collect()
    }

    /// Checks if the lookup is at capacity w.r.t. the permitted parallelism.
    ///
    /// While the lookup is stalled, up to `num_results` parallel probes are allowed.
    /// This is a slightly more permissive variant of the requirement that the initiator
    /// "resends the FIND_NODE to all of the k closest nodes it has not already queried".
    fn at_capacity(&self) -> bool {
        match self.progress {
            Progress::Stalled => self.num_waiting >= self.config.num_results,
            Progress::Iterating { .. } => self.num_waiting >= self.config.parallelism,
            Progress::Finished => true,
        }
    }
}

/// Stage of the lookup.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Progress {
    /// The lookup is making progress by iterating towards `num_results` closest peers
    /// to the target with a maximum of `parallelism` peers for which the lookup is
    /// waiting for results at a time.
    ///
    /// > **Note**: When the lookup switches back to `Iterating` after being `Stalled`,
    /// > it may temporarily be waiting for more than `parallelism` results from peers,
    /// > with new peers only being considered once the number of pending results drops
    /// > below `parallelism`.
    Iterating {
        /// The number of consecutive results that did not yield a peer closer to the
        /// target. When this number reaches `parallelism` and no new peer was
        /// discovered or at least `num_results` peers are known to the lookup, it is
        /// considered `Stalled`.
        no_progress: usize,
    },

    /// A lookup is stalled when it did not make progress after `parallelism`
    /// consecutive successful results (see `on_success`).
    ///
    /// While the lookup is stalled, the maximum allowed parallelism for pending results
    /// is increased to `num_results` in an attempt to finish the lookup. If the lookup
    /// can make progress again upon receiving the remaining results, it switches back
    /// to `Iterating`. Otherwise it will be finished.
    Stalled,

    /// The lookup is finished.
    ///
    /// A lookup finishes either when it has collected `num_results` results from the
    /// closest peers (not counting those that failed or are unresponsive) or because
    /// the lookup ran out of peers that have not yet delivered results (or failed).
    Finished,
}

/// Representation of a peer in the context of a lookup.
#[derive(Debug, Clone)]
struct LookupPeer<TNodeId> {
    /// The `KBucket` key used to identify the peer.
    key: Key<TNodeId>,

    /// The probe iteration this peer is at, counted from 1.
    iteration: usize,

    /// The number of peers that have been returned by this peer.
    peers_returned: usize,

    /// The current lookup state of this peer.
    state: PeerState,
}

impl<TNodeId> LookupPeer<TNodeId> {
    fn new(key: Key<TNodeId>) -> Self {
        LookupPeer {
            key,
            iteration: 1,
            peers_returned: 0,
            state: PeerState::NotContacted,
        }
    }
}

/// The state of a `LookupPeer` in the context of a lookup.
#[derive(Debug, Copy, Clone)]
enum PeerState {
    /// The peer has not yet been probed.
    ///
    /// This is the starting state for every peer known to, or discovered by, a lookup,
    /// and the state a probed peer returns to while it has probe iterations left.
    NotContacted,

    /// The lookup is waiting for a result from the peer.
    Waiting(Instant),

    /// A result was not delivered for the peer within the configured timeout.
    ///
    /// The peer is not taken into account for the termination conditions of the lookup
    /// until and unless it responds.
    Unresponsive,

    /// Obtaining a result from the peer has failed.
    ///
    /// This is a final state, reached as a result of a call to `on_failure`.
    Failed,

    /// A successful result from the peer has been delivered for its final iteration.
    ///
    /// This is a final state, reached as a result of a call to `on_success`.
    Succeeded,
}
