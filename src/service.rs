//! The protocol-level service behaviour of the discovery node.
//!
//! The [`Service`] runs on its own task and is the sole owner of the routing table
//! bookkeeping, the request registry and all lookup state. It consumes events from the
//! session layer, classifies incoming messages, matches responses to outstanding
//! requests, reassembles multi-packet NODES responses and maintains the keep-alive set
//! of connected peers.
//!
//! Discovered ENR's are not automatically added to the routing table. Only established
//! sessions get added, ensuring only contactable records are stored. Manual additions
//! can be made with [`crate::Discv5::add_enr`].

use crate::{
    config::Config,
    error::Error,
    kbucket::{self, InsertResult, KBucketsTable, Key, NodeStatus},
    lookup::{LookupConfig, LookupId, LookupPool, PoolState, ProbePeer},
    rpc::{
        ProtocolMessage, Request, Response, RpcId, RpcType, MAX_NODES_RESPONSES,
        NODES_PER_PACKET,
    },
    session_service::{AuthTag, SessionEvent, SessionService},
    timer_set::TimerSet,
    Enr,
};
use enr::NodeId;
use fnv::FnvHashMap;
use futures::{future, StreamExt};
use parking_lot::RwLock;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, task::Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

mod ip_vote;
mod lookup_info;
mod test;

use ip_vote::IpVote;
use lookup_info::{LookupInfo, MAX_FINDNODE_PROBES};

/// The number of events the application event stream can buffer before new events are
/// dropped.
const EVENT_STREAM_CHANNEL_SIZE: usize = 30;

/// Requests the application can make to the service task.
pub enum ServiceRequest {
    /// Adds a record to the routing table in a disconnected state.
    AddEnr(Enr),
    /// Starts an iterative lookup for the closest peers to the target. The found
    /// records are delivered over the callback.
    FindNode {
        target: NodeId,
        callback: oneshot::Sender<Vec<Enr>>,
    },
    /// Pings every peer in the keep-alive set. Used after the local record changes so
    /// peers fetch the bumped sequence number.
    PingConnectedPeers,
    /// Subscribes to the application event stream.
    RequestEventStream(oneshot::Sender<mpsc::Receiver<Event>>),
}

/// Events the service emits to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A node has been discovered through a lookup or a NODES response.
    ///
    /// The ENR of the node is returned. These records are not guaranteed to be live or
    /// contactable.
    Discovered(Enr),
    /// A new ENR was added to the routing table, possibly evicting a challenged entry.
    EnrAdded { enr: Enr, replaced: Option<Enr> },
    /// A node has sent a TALKREQ. Reserved as an application-protocol extension point.
    TalkRequest {
        node_id: NodeId,
        protocol: Vec<u8>,
        request: Vec<u8>,
    },
}

/// A request sent by us, awaiting a response, keyed in the registry by its rpc id.
#[derive(Debug)]
struct ActiveRequest {
    /// The node the request was sent to.
    node_id: NodeId,
    /// The body of the request.
    request: Request,
    /// The lookup this request was made on behalf of, if any.
    lookup_id: Option<LookupId>,
}

/// For multi-packet NODES responses, tracks the number of packets received and the
/// records accumulated so far.
struct NodesResponse {
    /// The number of packets accounted for, starting at 1 for the first.
    count: usize,
    /// The filtered records that have been received.
    received_nodes: Vec<Enr>,
}

impl Default for NodesResponse {
    fn default() -> Self {
        NodesResponse {
            count: 1,
            received_nodes: Vec::new(),
        }
    }
}

/// The outcome of polling the lookup pool inside the event loop.
enum LookupEvent {
    /// A lookup wants the given peer probed.
    Waiting(LookupId, ProbePeer<NodeId>),
    /// A lookup completed.
    Finished(Box<crate::lookup::Lookup<LookupInfo, NodeId>>),
    /// A lookup exceeded the pool-wide timeout; its partial results are still reported.
    TimedOut(Box<crate::lookup::Lookup<LookupInfo, NodeId>>),
}

pub struct Service {
    /// Configuration parameters for the service.
    config: Config,

    /// The local ENR of the node, shared with the application facade.
    local_enr: Arc<RwLock<Enr>>,

    /// Storage of the ENR record for each node, shared with the application facade.
    kbuckets: Arc<RwLock<KBucketsTable<NodeId, Enr>>>,

    /// All the iterative lookups we are currently performing.
    lookups: LookupPool<LookupInfo, NodeId>,

    /// RPC requests that have been sent and are awaiting a response.
    active_requests: FnvHashMap<RpcId, ActiveRequest>,

    /// Accumulators for multi-packet NODES responses, keyed by the request's rpc id.
    active_nodes_responses: HashMap<RpcId, NodesResponse>,

    /// A map of votes that nodes have made about our external address.
    ip_votes: Option<IpVote>,

    /// The peers we have established sessions with, each with a periodic PING timer.
    peers_to_ping: TimerSet<NodeId>,

    /// The session layer the service sends through.
    session: Box<dyn SessionService>,

    /// The stream of events from the session layer.
    session_events: mpsc::Receiver<SessionEvent>,

    /// The channel the application listens to events on, once subscribed.
    event_stream: Option<mpsc::Sender<Event>>,

    /// The channel of application requests.
    service_recv: mpsc::Receiver<ServiceRequest>,

    /// The exit signal from the application.
    exit: oneshot::Receiver<()>,
}

impl Service {
    /// Starts the session layer and spawns the service task, returning the exit signal
    /// and the request channel for it.
    pub async fn spawn(
        local_enr: Arc<RwLock<Enr>>,
        kbuckets: Arc<RwLock<KBucketsTable<NodeId, Enr>>>,
        config: Config,
        mut session: Box<dyn SessionService>,
    ) -> Result<(oneshot::Sender<()>, mpsc::Sender<ServiceRequest>), Error> {
        let session_events = session.start().await?;

        let (exit_send, exit) = oneshot::channel();
        let (service_send, service_recv) = mpsc::channel(50);

        let ip_votes = if config.enr_update {
            Some(IpVote::new(config.enr_peer_update_min))
        } else {
            None
        };

        let executor = config.executor.clone().expect("Executor must be present");
        let lookups = LookupPool::new(config.lookup_timeout);
        let mut service = Service {
            config,
            local_enr,
            kbuckets,
            lookups,
            active_requests: Default::default(),
            active_nodes_responses: HashMap::new(),
            ip_votes,
            peers_to_ping: TimerSet::new(),
            session,
            session_events,
            event_stream: None,
            service_recv,
            exit,
        };

        executor.spawn(Box::pin(async move {
            service.start().await;
        }));

        Ok((exit_send, service_send))
    }

    /// The main event loop of the service.
    async fn start(&mut self) {
        loop {
            tokio::select! {
                _ = &mut self.exit => {
                    info!("Discovery service shutting down");
                    self.shutdown().await;
                    return;
                }
                Some(service_request) = self.service_recv.recv() => {
                    match service_request {
                        ServiceRequest::AddEnr(enr) => self.add_enr(enr),
                        ServiceRequest::FindNode { target, callback } => {
                            self.start_findnode_lookup(target, callback)
                        }
                        ServiceRequest::PingConnectedPeers => self.ping_connected_peers(),
                        ServiceRequest::RequestEventStream(callback) => {
                            let (event_stream, event_stream_recv) =
                                mpsc::channel(EVENT_STREAM_CHANNEL_SIZE);
                            self.event_stream = Some(event_stream);
                            if callback.send(event_stream_recv).is_err() {
                                error!("Failed to return the event stream channel");
                            }
                        }
                    }
                }
                Some(event) = self.session_events.recv() => self.inject_session_event(event),
                Some(node_id) = self.peers_to_ping.next() => {
                    debug!("Pinging connected peer: {}", node_id);
                    self.send_ping(&node_id);
                }
                lookup_event = Service::lookup_event_poll(&mut self.lookups) => {
                    match lookup_event {
                        LookupEvent::Waiting(lookup_id, probe) => {
                            self.send_lookup_probe(lookup_id, &probe)
                        }
                        LookupEvent::Finished(lookup) => self.lookup_finished(*lookup),
                        LookupEvent::TimedOut(lookup) => {
                            warn!("Lookup id: {:?} timed out", lookup.id());
                            self.lookup_finished(*lookup);
                        }
                    }
                }
            }

            // Report entries that were promoted from the pending slot by this round of
            // processing, along with the entries they evicted.
            loop {
                let applied = self.kbuckets.write().take_applied_pending();
                match applied {
                    Some(applied) => self.send_event(Event::EnrAdded {
                        enr: applied.inserted.value,
                        replaced: applied.evicted.map(|node| node.value),
                    }),
                    None => break,
                }
            }
        }
    }

    /// Polls the lookup pool, pending while there is no actionable lookup state.
    async fn lookup_event_poll(lookups: &mut LookupPool<LookupInfo, NodeId>) -> LookupEvent {
        future::poll_fn(move |_cx| match lookups.poll() {
            PoolState::Finished(lookup) => Poll::Ready(LookupEvent::Finished(Box::new(lookup))),
            PoolState::Waiting(Some((lookup, probe))) => {
                Poll::Ready(LookupEvent::Waiting(lookup.id(), probe))
            }
            PoolState::Timeout(lookup) => Poll::Ready(LookupEvent::TimedOut(Box::new(lookup))),
            PoolState::Waiting(None) | PoolState::Idle => Poll::Pending,
        })
        .await
    }

    /// Dispatches an event from the session layer.
    fn inject_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Established(enr) => self.inject_session_established(enr),
            SessionEvent::Message {
                src_id,
                src,
                message,
            } => {
                let ProtocolMessage { id, body } = *message;
                match body {
                    RpcType::Request(request) => self.handle_rpc_request(src, src_id, id, request),
                    RpcType::Response(response) => self.handle_rpc_response(src_id, id, response),
                }
            }
            SessionEvent::WhoAreYouRequest {
                src,
                src_id,
                auth_tag,
            } => self.handle_whoareyou_request(src, src_id, auth_tag),
            SessionEvent::RequestFailed(node_id, rpc_id) => self.rpc_failure(node_id, rpc_id),
        }
    }

    /// Processes an RPC request from a peer. Requests respond to the received socket
    /// address, rather than the IP of the known ENR.
    fn handle_rpc_request(
        &mut self,
        src: SocketAddr,
        node_id: NodeId,
        rpc_id: RpcId,
        req: Request,
    ) {
        match req {
            Request::FindNode { distance } => {
                // if the distance is 0 send our local ENR
                if distance == 0 {
                    let response = ProtocolMessage::response(
                        rpc_id,
                        Response::Nodes {
                            total: 1,
                            nodes: vec![self.local_enr.read().clone()],
                        },
                    );
                    debug!("Sending our ENR to node: {}", node_id);
                    if let Err(e) = self.session.send_response(src, &node_id, response) {
                        warn!("Failed to send a NODES response. Error: {:?}", e);
                    }
                    return;
                }
                self.send_nodes_response(src, node_id, rpc_id, distance);
            }
            Request::Ping { enr_seq } => {
                // check if we need to update the known ENR
                let requires_update = {
                    let mut kbuckets = self.kbuckets.write();
                    let key = kbucket::Key::from(node_id);
                    match kbuckets.entry(&key) {
                        kbucket::Entry::Present(mut entry, _) => entry.value().seq() < enr_seq,
                        kbucket::Entry::Pending(mut entry, _) => entry.value().seq() < enr_seq,
                        // don't know of the ENR, request the update
                        _ => true,
                    }
                };
                if requires_update {
                    self.request_enr(&node_id, src);
                }

                // build the PONG response
                let response = ProtocolMessage::response(
                    rpc_id,
                    Response::Pong {
                        enr_seq: self.local_enr.read().seq(),
                        ip: src.ip(),
                        port: src.port(),
                    },
                );
                debug!("Sending PONG response to node: {}", node_id);
                if let Err(e) = self.session.send_response(src, &node_id, response) {
                    warn!("Failed to send a PONG response. Error: {:?}", e);
                }
            }
            Request::Talk { protocol, request } => {
                let response = (self.config.talkreq_callback)(&protocol, &request);
                let message = ProtocolMessage::response(rpc_id, Response::Talk { response });
                if let Err(e) = self.session.send_response(src, &node_id, message) {
                    warn!("Failed to send a TALK response. Error: {:?}", e);
                }
                self.send_event(Event::TalkRequest {
                    node_id,
                    protocol,
                    request,
                });
            }
        }
    }

    /// Processes an RPC response from a peer.
    fn handle_rpc_response(&mut self, node_id: NodeId, rpc_id: RpcId, response: Response) {
        // verify we know of the rpc id
        let active = match self.active_requests.remove(&rpc_id) {
            Some(active) => active,
            None => {
                warn!("Received an RPC response which doesn't match a request");
                return;
            }
        };

        if active.node_id != node_id {
            // A response to our id from a node the request was not sent to. Keep
            // waiting for the genuine response.
            warn!(
                "Received a response for rpc id: {} from an unexpected node: {}",
                rpc_id, node_id
            );
            self.active_requests.insert(rpc_id, active);
            return;
        }

        if !response.match_request(&active.request) {
            warn!(
                "Node gave an incorrect response type. Ignoring response from node: {}",
                node_id
            );
            return;
        }

        match response {
            Response::Nodes { total, mut nodes } => {
                if total > MAX_NODES_RESPONSES as u64 {
                    warn!(
                        "NODES response has a total larger than {}, nodes will be truncated",
                        MAX_NODES_RESPONSES
                    );
                }

                // Filter out any nodes that are not at the requested distance.
                // TODO: downvote the responder here once a peer reputation is built.
                let distance_requested = match active.request {
                    Request::FindNode { distance } => distance,
                    _ => unreachable!("A NODES response only matches a FINDNODE request"),
                };
                let local_key: Key<NodeId> = self.local_enr.read().node_id().into();
                if distance_requested != 0 {
                    nodes.retain(|enr| {
                        local_key.log2_distance(&enr.node_id().into()) == Some(distance_requested)
                    });
                } else {
                    // an ENR update was requested; the only valid record is the
                    // responder's own
                    nodes.retain(|enr| enr.node_id() == node_id);
                }

                // handle the case that there is more than one packet
                if total > 1 {
                    let mut current_response = self
                        .active_nodes_responses
                        .remove(&rpc_id)
                        .unwrap_or_default();

                    debug!(
                        "NODES response: {} of {} received",
                        current_response.count, total
                    );
                    // if there are more packets coming, store the nodes and wait for
                    // another response
                    if current_response.count < MAX_NODES_RESPONSES
                        && (current_response.count as u64) < total
                    {
                        current_response.count += 1;
                        current_response.received_nodes.append(&mut nodes);
                        self.active_requests.insert(rpc_id, active);
                        self.active_nodes_responses
                            .insert(rpc_id, current_response);
                        return;
                    }

                    // have received all the NODES packets we are willing to accept;
                    // duplicates are handled when updating the routing table
                    current_response.received_nodes.append(&mut nodes);
                    nodes = current_response.received_nodes;
                }

                debug!(
                    "Received a NODES response of len: {}, total: {}, from node: {}",
                    nodes.len(),
                    total,
                    node_id
                );
                // note: If a peer sends an initial NODES response with a total > 1 then
                // in a later response sends a response with a total of 1, all previous
                // nodes will be ignored. Ensure any mapping is removed in this case.
                self.active_nodes_responses.remove(&rpc_id);

                self.discovered(&node_id, nodes, active.lookup_id);
            }
            Response::Pong { enr_seq, ip, port } => {
                // Record this peer's report of our external address. The reports are
                // only ingested; acting on their agreement feeds a future record
                // update.
                if let Some(ref mut ip_votes) = self.ip_votes {
                    ip_votes.record(node_id, SocketAddr::new(ip, port));
                }

                // check if we need to request a newer ENR
                if let Some(enr) = self.find_enr(&node_id) {
                    if enr.seq() < enr_seq {
                        debug!("Requesting an ENR update from node: {}", node_id);
                        let req = Request::FindNode { distance: 0 };
                        self.send_rpc_request(&node_id, req, None);
                    }
                    self.connection_updated(node_id, Some(enr), NodeStatus::Connected);
                }
            }
            Response::Talk { .. } => {
                debug!("Received TALK response from node: {}", node_id);
            }
        }
    }

    /// Processes discovered peers from a NODES response.
    fn discovered(&mut self, source: &NodeId, enrs: Vec<Enr>, lookup_id: Option<LookupId>) {
        let local_id = self.local_enr.read().node_id();
        let others: Vec<Enr> = enrs
            .into_iter()
            .filter(|enr| enr.node_id() != local_id)
            .collect();

        // If any of the discovered nodes are in the routing table with an older record,
        // update the record in place. Unknown nodes are only handed to the session
        // layer; they enter the table once a session is established.
        let mut session_updates = Vec::new();
        {
            let mut kbuckets = self.kbuckets.write();
            for enr in &others {
                let key = kbucket::Key::from(enr.node_id());
                match kbuckets.entry(&key) {
                    kbucket::Entry::Present(mut entry, _) => {
                        if entry.value().seq() < enr.seq() {
                            trace!("ENR updated: {}", enr);
                            *entry.value() = enr.clone();
                            session_updates.push(enr.clone());
                        }
                    }
                    kbucket::Entry::Pending(mut entry, _) => {
                        if entry.value().seq() < enr.seq() {
                            trace!("ENR updated: {}", enr);
                            *entry.value() = enr.clone();
                            session_updates.push(enr.clone());
                        }
                    }
                    kbucket::Entry::Absent(_) => session_updates.push(enr.clone()),
                    _ => {}
                }
            }
        }
        for enr in session_updates {
            self.session.update_enr(enr);
        }

        if self.config.report_discovered_peers {
            for enr in &others {
                self.send_event(Event::Discovered(enr.clone()));
            }
        }

        // if this is part of a lookup, update the lookup
        if let Some(lookup_id) = lookup_id {
            if let Some(lookup) = self.lookups.get_mut(lookup_id) {
                for enr in &others {
                    let untrusted_enrs = &mut lookup.target_mut().untrusted_enrs;
                    if untrusted_enrs
                        .iter()
                        .all(|known| known.node_id() != enr.node_id())
                    {
                        untrusted_enrs.push(enr.clone());
                    }
                }
                debug!("{} peers found for lookup id {:?}", others.len(), lookup_id);
                let peer_ids: Vec<NodeId> = others.iter().map(|enr| enr.node_id()).collect();
                lookup.on_success(source, &peer_ids);
            }
        }
    }

    /// Update the connection status of a node in the routing table.
    fn connection_updated(&mut self, node_id: NodeId, enr: Option<Enr>, new_status: NodeStatus) {
        let key = kbucket::Key::from(node_id);
        let mut inserted = None;
        let mut ping_victim = None;
        {
            let mut kbuckets = self.kbuckets.write();
            match kbuckets.entry(&key) {
                kbucket::Entry::Present(mut entry, old_status) => {
                    if let Some(enr) = enr {
                        *entry.value() = enr;
                    }
                    if old_status != new_status {
                        entry.update(new_status);
                    }
                }
                kbucket::Entry::Pending(mut entry, old_status) => {
                    if let Some(enr) = enr {
                        *entry.value() = enr;
                    }
                    if old_status != new_status {
                        entry.update(new_status);
                    }
                }
                kbucket::Entry::Absent(entry) => {
                    if new_status == NodeStatus::Connected {
                        // Note: If an ENR is not provided, no record is added.
                        debug_assert!(enr.is_some());
                        if let Some(enr) = enr {
                            match entry.insert(enr.clone(), new_status) {
                                InsertResult::Inserted => {
                                    inserted = Some(Event::EnrAdded {
                                        enr,
                                        replaced: None,
                                    });
                                }
                                InsertResult::Full | InsertResult::NodeExists => (),
                                InsertResult::Pending { victim } => {
                                    ping_victim = Some(victim.into_preimage());
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(event) = inserted {
            self.send_event(event);
        }
        if let Some(victim) = ping_victim {
            // challenge the least-recently seen occupant of the full bucket
            self.send_ping(&victim);
        }
    }

    /// A session key-pair has been negotiated with a peer: mark it connected, send the
    /// initial PING and install its keep-alive timer.
    fn inject_session_established(&mut self, enr: Enr) {
        let node_id = enr.node_id();
        debug!("Session established with node: {}", node_id);
        self.connection_updated(node_id, Some(enr), NodeStatus::Connected);
        // send an initial ping and start the ping interval
        self.send_ping(&node_id);
        self.peers_to_ping.arm(node_id, self.config.ping_interval);
    }

    /// A session could not be established or an RPC request timed out (after the session
    /// layer's retries).
    fn rpc_failure(&mut self, node_id: NodeId, rpc_id: RpcId) {
        if let Some(active) = self.active_requests.remove(&rpc_id) {
            debug_assert_eq!(active.node_id, node_id);

            match active.request {
                // if a failed FINDNODE request has partially received packets, process
                // the partially found nodes rather than losing them
                Request::FindNode { .. } => {
                    if let Some(nodes_response) = self.active_nodes_responses.remove(&rpc_id) {
                        if !nodes_response.received_nodes.is_empty() {
                            warn!(
                                "NODES response failed, but was partially processed from node: {}",
                                node_id
                            );
                            self.discovered(
                                &node_id,
                                nodes_response.received_nodes,
                                active.lookup_id,
                            );
                        }
                    } else if let Some(lookup_id) = active.lookup_id {
                        // there was no partial download; inform the lookup of the failure
                        if let Some(lookup) = self.lookups.get_mut(lookup_id) {
                            lookup.on_failure(&node_id);
                        }
                    } else {
                        debug!(
                            "Failed RPC request: {} for node: {}",
                            active.request, node_id
                        );
                    }
                }
                // for all other requests, if they are lookup requests, mark the failure
                _ => {
                    if let Some(lookup_id) = active.lookup_id {
                        if let Some(lookup) = self.lookups.get_mut(lookup_id) {
                            debug!(
                                "Failed lookup request: {} for lookup: {:?} and node: {}",
                                active.request, lookup_id, node_id
                            );
                            lookup.on_failure(&node_id);
                        }
                    } else {
                        debug!(
                            "Failed RPC request: {} for node: {}",
                            active.request, node_id
                        );
                    }
                }
            }
        }

        // report the node as being disconnected
        debug!("Session dropped with node: {}", node_id);
        self.connection_updated(node_id, None, NodeStatus::Disconnected);
        self.peers_to_ping.cancel(&node_id);
    }

    /// Answers a WHOAREYOU challenge request from the session layer with the best record
    /// we hold for the node, including records inside active lookups' untrusted sets.
    fn handle_whoareyou_request(&mut self, src: SocketAddr, src_id: NodeId, auth_tag: AuthTag) {
        if let Some(known_enr) = self.find_enr(&src_id) {
            let enr_seq = known_enr.seq();
            self.session
                .send_whoareyou(src, &src_id, enr_seq, Some(known_enr), auth_tag);
        } else {
            // do not know of this peer
            debug!("NodeId unknown, requesting ENR. NodeId: {}", src_id);
            self.session.send_whoareyou(src, &src_id, 0, None, auth_tag);
        }
    }

    /// Attempts to add a record to the routing table in a disconnected state, reporting
    /// `EnrAdded` on insertion.
    fn add_enr(&mut self, enr: Enr) {
        let key = kbucket::Key::from(enr.node_id());
        let mut inserted = None;
        let mut ping_victim = None;
        {
            let mut kbuckets = self.kbuckets.write();
            match kbuckets.entry(&key) {
                kbucket::Entry::Present(mut entry, _) => {
                    if entry.value().seq() < enr.seq() {
                        *entry.value() = enr;
                    }
                }
                kbucket::Entry::Pending(mut entry, _) => {
                    if entry.value().seq() < enr.seq() {
                        *entry.value() = enr;
                    }
                }
                kbucket::Entry::Absent(entry) => {
                    match entry.insert(enr.clone(), NodeStatus::Disconnected) {
                        InsertResult::Inserted => {
                            inserted = Some(Event::EnrAdded {
                                enr,
                                replaced: None,
                            });
                        }
                        InsertResult::Full | InsertResult::NodeExists => (),
                        InsertResult::Pending { victim } => {
                            ping_victim = Some(victim.into_preimage());
                        }
                    }
                }
                kbucket::Entry::SelfEntry => {}
            }
        }
        if let Some(event) = inserted {
            self.send_event(event);
        }
        if let Some(victim) = ping_victim {
            self.send_ping(&victim);
        }
    }

    // Send RPC requests and responses //

    /// Sends a PING request to a node.
    fn send_ping(&mut self, node_id: &NodeId) {
        let req = Request::Ping {
            enr_seq: self.local_enr.read().seq(),
        };
        self.send_rpc_request(node_id, req, None);
    }

    /// Sends a PING to every member of the keep-alive set.
    fn ping_connected_peers(&mut self) {
        let connected: Vec<NodeId> = self.peers_to_ping.keys().copied().collect();
        for node_id in connected {
            self.send_ping(&node_id);
        }
    }

    /// Requests an external node's ENR before a session exists, addressed by socket.
    fn request_enr(&mut self, node_id: &NodeId, src: SocketAddr) {
        let id: RpcId = rand::random();
        let request = Request::FindNode { distance: 0 };
        let message = ProtocolMessage::request(id, request.clone());
        debug!("Sending ENR request to node: {}", node_id);

        match self.session.send_request_unknown_enr(src, node_id, message) {
            Ok(()) => {
                self.active_requests.insert(
                    id,
                    ActiveRequest {
                        node_id: *node_id,
                        request,
                        lookup_id: None,
                    },
                );
            }
            Err(e) => warn!("Requesting ENR failed. Node: {}, Error: {:?}", node_id, e),
        }
    }

    /// Answers a FINDNODE request with the contents of the requested distance shell.
    fn send_nodes_response(
        &mut self,
        dst: SocketAddr, // overwrites the ENR IP - we respond to the address the request came from
        dst_id: NodeId,
        rpc_id: RpcId,
        distance: u64,
    ) {
        let nodes: Vec<Enr> = self
            .kbuckets
            .write()
            .nodes_by_distance(distance)
            .into_iter()
            .filter(|enr| enr.node_id() != dst_id)
            .collect();
        self.respond_with_nodes(dst, dst_id, rpc_id, nodes);
    }

    /// Sends a NODES response carrying the given records, split into as many packets as
    /// needed, all sharing the rpc id and total. An empty set is reported as a single
    /// empty packet.
    fn respond_with_nodes(
        &mut self,
        dst: SocketAddr,
        dst_id: NodeId,
        rpc_id: RpcId,
        nodes: Vec<Enr>,
    ) {
        if nodes.is_empty() {
            let response = ProtocolMessage::response(
                rpc_id,
                Response::Nodes {
                    total: 1,
                    nodes: Vec::new(),
                },
            );
            trace!("Sending empty NODES response to: {}", dst_id);
            if let Err(e) = self.session.send_response(dst, &dst_id, response) {
                warn!("Failed to send a NODES response. Error: {:?}", e);
            }
            return;
        }

        // A packet has room for NODES_PER_PACKET maximum-size records below the packet
        // size limit.
        let total = (nodes.len() + NODES_PER_PACKET - 1) / NODES_PER_PACKET;
        for chunk in nodes.chunks(NODES_PER_PACKET) {
            let response = ProtocolMessage::response(
                rpc_id,
                Response::Nodes {
                    total: total as u64,
                    nodes: chunk.to_vec(),
                },
            );
            trace!("Sending NODES response to: {}. Total: {}", dst_id, total);
            if let Err(e) = self.session.send_response(dst, &dst_id, response) {
                warn!("Failed to send a NODES response. Error: {:?}", e);
            }
        }
    }

    /// Constructs and sends the FINDNODE request for a lookup probe.
    fn send_lookup_probe(&mut self, lookup_id: LookupId, probe: &ProbePeer<NodeId>) {
        trace!(
            "Sending lookup probe. Iteration: {}, node: {}",
            probe.iteration,
            probe.node_id
        );
        let request = match self.lookups.get_mut(lookup_id) {
            Some(lookup) => match lookup.target().rpc_request(probe) {
                Ok(request) => request,
                Err(e) => {
                    // the probed peer is the target itself; a per-peer failure
                    error!("Lookup probe error: {}", e);
                    lookup.on_failure(&probe.node_id);
                    return;
                }
            },
            None => return,
        };
        self.send_rpc_request(&probe.node_id, request, Some(lookup_id));
    }

    /// Sends a generic RPC request. The request is registered as outstanding, awaiting a
    /// response or a failure.
    fn send_rpc_request(
        &mut self,
        node_id: &NodeId,
        request: Request,
        lookup_id: Option<LookupId>,
    ) {
        // find the destination ENR
        if let Some(dst_enr) = self.find_enr(node_id) {
            let id: RpcId = rand::random();
            debug!("Sending RPC request: {} to node: {}", request, node_id);
            let message = ProtocolMessage::request(id, request.clone());
            match self.session.send_request(&dst_enr, message) {
                Ok(()) => {
                    self.active_requests.insert(
                        id,
                        ActiveRequest {
                            node_id: *node_id,
                            request,
                            lookup_id,
                        },
                    );
                }
                Err(e) => {
                    warn!("Sending request to node: {} failed. Error: {:?}", node_id, e);
                    self.fail_lookup_peer(lookup_id, node_id);
                }
            }
        } else {
            warn!(
                "Request not sent. Failed to find ENR for node: {}",
                node_id
            );
            self.fail_lookup_peer(lookup_id, node_id);
        }
    }

    /// Marks a peer failed in its lookup, if the request belonged to one.
    fn fail_lookup_peer(&mut self, lookup_id: Option<LookupId>, node_id: &NodeId) {
        if let Some(lookup_id) = lookup_id {
            if let Some(lookup) = self.lookups.get_mut(lookup_id) {
                lookup.on_failure(node_id);
            }
        }
    }

    /// Returns an ENR if one is known for the given NodeId, consulting the routing table
    /// first and then the untrusted records of every live lookup.
    fn find_enr(&mut self, node_id: &NodeId) -> Option<Enr> {
        // check if we know this node id in our routing table
        let key = kbucket::Key::from(*node_id);
        if let kbucket::Entry::Present(mut entry, _) = self.kbuckets.write().entry(&key) {
            return Some(entry.value().clone());
        }
        // check the untrusted addresses for ongoing lookups
        for lookup in self.lookups.iter() {
            if let Some(enr) = lookup
                .target()
                .untrusted_enrs
                .iter()
                .find(|enr| &enr.node_id() == node_id)
            {
                return Some(enr.clone());
            }
        }
        None
    }

    /// Starts an iterative lookup for the closest peers to the target.
    fn start_findnode_lookup(&mut self, target: NodeId, callback: oneshot::Sender<Vec<Enr>>) {
        let target_key: Key<NodeId> = target.into();
        let known_closest_peers = self.kbuckets.write().closest_keys(&target_key);

        let lookup_info = LookupInfo {
            target,
            untrusted_enrs: Default::default(),
            callback,
        };
        let lookup_config = LookupConfig::new_from_config(&self.config);
        let lookup_id = self.lookups.add_lookup(
            lookup_config,
            lookup_info,
            target_key,
            known_closest_peers,
            MAX_FINDNODE_PROBES,
        );
        debug!("Lookup {:?} started for target: {}", lookup_id, target);
    }

    /// Resolves a completed lookup's node ids into records and delivers them to the
    /// caller. Unresolvable ids are dropped.
    fn lookup_finished(&mut self, lookup: crate::lookup::Lookup<LookupInfo, NodeId>) {
        let (info, closest_peers) = lookup.into_result();

        let mut found = Vec::new();
        for node_id in closest_peers {
            if let Some(enr) = info
                .untrusted_enrs
                .iter()
                .find(|enr| enr.node_id() == node_id)
            {
                found.push(enr.clone());
            } else if let Some(enr) = self.find_enr(&node_id) {
                found.push(enr);
            }
        }
        debug!(
            "Lookup for target: {} completed with {} results",
            info.target,
            found.len()
        );

        if info.callback.send(found).is_err() {
            warn!("Callback dropped for lookup of target: {}", info.target);
        }
    }

    /// Emits an event to the application, if a stream has been subscribed.
    fn send_event(&mut self, event: Event) {
        if let Some(stream) = self.event_stream.as_mut() {
            match stream.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    debug!("The event stream is full, dropping event: {:?}", event)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // the application dropped its receiver
                    self.event_stream = None;
                }
            }
        }
    }

    /// Tears the service down: stops all lookups, clears the request registry, response
    /// accumulators and keep-alive timers, and awaits the session layer's shutdown.
    async fn shutdown(&mut self) {
        self.lookups.clear();
        self.active_requests.clear();
        self.active_nodes_responses.clear();
        self.peers_to_ping.clear();
        self.session.stop().await;
    }
}
