#![cfg(test)]

use super::*;
use crate::error::RequestError;
use crate::session_service::AUTH_TAG_LENGTH;
use crate::{ConfigBuilder, Discv5};
use enr::{CombinedKey, EnrBuilder};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::timeout;

/// Outbound traffic recorded by the mock session layer.
#[derive(Debug, Clone)]
enum Outbound {
    Request {
        dst: NodeId,
        message: ProtocolMessage,
    },
    Response {
        dst_id: NodeId,
        message: ProtocolMessage,
    },
    RequestUnknownEnr {
        dst_id: NodeId,
        message: ProtocolMessage,
    },
    WhoAreYou {
        dst_id: NodeId,
        enr_seq: u64,
        enr: Option<Enr>,
    },
    EnrUpdate(Enr),
}

/// A session layer that records everything the service sends.
#[derive(Clone, Default)]
struct MockSession {
    outbound: Arc<Mutex<Vec<Outbound>>>,
    events: Arc<Mutex<Option<mpsc::Sender<SessionEvent>>>>,
}

impl MockSession {
    fn sent(&self) -> Vec<Outbound> {
        self.outbound.lock().clone()
    }

    fn take_sent(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.outbound.lock())
    }

    async fn inject(&self, event: SessionEvent) {
        let sender = self.events.lock().clone().expect("Session started");
        sender.send(event).await.expect("Service is running");
    }
}

impl SessionService for MockSession {
    fn start(&mut self) -> BoxFuture<'static, Result<mpsc::Receiver<SessionEvent>, Error>> {
        let (tx, rx) = mpsc::channel(50);
        *self.events.lock() = Some(tx);
        Box::pin(async move { Ok(rx) })
    }

    fn stop(&mut self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    fn send_request(
        &mut self,
        dst_enr: &Enr,
        message: ProtocolMessage,
    ) -> Result<(), RequestError> {
        self.outbound.lock().push(Outbound::Request {
            dst: dst_enr.node_id(),
            message,
        });
        Ok(())
    }

    fn send_response(
        &mut self,
        _dst: SocketAddr,
        dst_id: &NodeId,
        message: ProtocolMessage,
    ) -> Result<(), RequestError> {
        self.outbound.lock().push(Outbound::Response {
            dst_id: *dst_id,
            message,
        });
        Ok(())
    }

    fn send_request_unknown_enr(
        &mut self,
        _dst: SocketAddr,
        dst_id: &NodeId,
        message: ProtocolMessage,
    ) -> Result<(), RequestError> {
        self.outbound.lock().push(Outbound::RequestUnknownEnr {
            dst_id: *dst_id,
            message,
        });
        Ok(())
    }

    fn send_whoareyou(
        &mut self,
        _dst: SocketAddr,
        dst_id: &NodeId,
        enr_seq: u64,
        remote_enr: Option<Enr>,
        _auth_tag: AuthTag,
    ) {
        self.outbound.lock().push(Outbound::WhoAreYou {
            dst_id: *dst_id,
            enr_seq,
            enr: remote_enr,
        });
    }

    fn update_enr(&mut self, enr: Enr) {
        self.outbound.lock().push(Outbound::EnrUpdate(enr));
    }
}

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn build_enr(port: u16) -> (CombinedKey, Enr) {
    let key = CombinedKey::generate_secp256k1();
    let enr = EnrBuilder::new("v4")
        .ip4(Ipv4Addr::LOCALHOST)
        .udp4(port)
        .build(&key)
        .unwrap();
    (key, enr)
}

/// Generates an ENR whose node id is at the given log2 distance from `local_key`.
fn enr_at_distance(local_key: &Key<NodeId>, distance: u64, port: u16) -> Enr {
    loop {
        let (_, enr) = build_enr(port);
        if local_key.log2_distance(&enr.node_id().into()) == Some(distance) {
            return enr;
        }
    }
}

fn src_socket() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

/// Builds a service around a mock session layer, without running its event loop.
/// Handlers are driven directly by the tests.
fn build_service(local_enr: Enr, mock: &MockSession) -> Service {
    init();
    let config = ConfigBuilder::new().build();
    let (_exit_send, exit) = oneshot::channel();
    let (_service_send, service_recv) = mpsc::channel(50);
    let (_session_send, session_events) = mpsc::channel(50);

    let node_id = local_enr.node_id();
    Service {
        local_enr: Arc::new(RwLock::new(local_enr)),
        kbuckets: Arc::new(RwLock::new(KBucketsTable::new(
            node_id.into(),
            Duration::from_millis(100),
        ))),
        lookups: LookupPool::new(config.lookup_timeout),
        active_requests: Default::default(),
        active_nodes_responses: HashMap::new(),
        ip_votes: Some(IpVote::new(config.enr_peer_update_min)),
        peers_to_ping: TimerSet::new(),
        session: Box::new(mock.clone()),
        session_events,
        event_stream: None,
        service_recv,
        exit,
        config,
    }
}

/// Attaches an event stream to the service, returning the receiving end.
fn attach_event_stream(service: &mut Service) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(100);
    service.event_stream = Some(tx);
    rx
}

fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Returns the rpc id of the last outbound request sent to `dst`.
fn last_request_id(mock: &MockSession, dst: &NodeId) -> RpcId {
    mock.sent()
        .iter()
        .rev()
        .find_map(|out| match out {
            Outbound::Request { dst: d, message } if d == dst => Some(message.id),
            _ => None,
        })
        .expect("A request was sent")
}

#[tokio::test]
async fn findnode_distance_zero_returns_local_enr() {
    let (_key, local_enr) = build_enr(4001);
    let mock = MockSession::default();
    let mut service = build_service(local_enr.clone(), &mock);

    let peer = NodeId::random();
    service.handle_rpc_request(src_socket(), peer, 7, Request::FindNode { distance: 0 });

    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Outbound::Response { dst_id, message } => {
            assert_eq!(*dst_id, peer);
            assert_eq!(message.id, 7);
            assert_eq!(
                message.body,
                RpcType::Response(Response::Nodes {
                    total: 1,
                    nodes: vec![local_enr]
                })
            );
        }
        other => panic!("{:?}", other),
    }
    // no table change
    assert_eq!(service.kbuckets.write().iter().count(), 0);
}

#[tokio::test]
async fn findnode_empty_shell_returns_single_empty_packet() {
    let (_key, local_enr) = build_enr(4002);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let peer = NodeId::random();
    service.handle_rpc_request(src_socket(), peer, 9, Request::FindNode { distance: 250 });

    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Outbound::Response { message, .. } => {
            assert_eq!(message.id, 9);
            assert_eq!(
                message.body,
                RpcType::Response(Response::Nodes {
                    total: 1,
                    nodes: Vec::new()
                })
            );
        }
        other => panic!("{:?}", other),
    }
}

#[tokio::test]
async fn nodes_response_is_split_into_packets() {
    let (_key, local_enr) = build_enr(4003);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let records: Vec<Enr> = (0..40).map(|i| build_enr(5000 + i).1).collect();
    let peer = NodeId::random();
    service.respond_with_nodes(src_socket(), peer, 9, records.clone());

    let sent = mock.sent();
    assert_eq!(sent.len(), 14); // ceil(40 / 3)

    let mut concatenated = Vec::new();
    for out in sent {
        match out {
            Outbound::Response { dst_id, message } => {
                assert_eq!(dst_id, peer);
                assert_eq!(message.id, 9);
                match message.body {
                    RpcType::Response(Response::Nodes { total, mut nodes }) => {
                        assert_eq!(total, 14);
                        assert!(nodes.len() <= NODES_PER_PACKET);
                        concatenated.append(&mut nodes);
                    }
                    other => panic!("{:?}", other),
                }
            }
            other => panic!("{:?}", other),
        }
    }
    // the packets concatenate to the records in their original order
    assert_eq!(concatenated, records);
}

#[tokio::test]
async fn multi_packet_nodes_response_is_reassembled() {
    let (_key, local_enr) = build_enr(4004);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);
    let mut events = attach_event_stream(&mut service);

    // a peer we can address
    let (_qk, peer_q) = build_enr(4104);
    service.add_enr(peer_q.clone());

    let local_key: Key<NodeId> = service.local_enr.read().node_id().into();
    let a = enr_at_distance(&local_key, 256, 5104);
    let b = enr_at_distance(&local_key, 256, 5105);
    let c = enr_at_distance(&local_key, 256, 5106);
    let d = enr_at_distance(&local_key, 256, 5107);

    service.send_rpc_request(&peer_q.node_id(), Request::FindNode { distance: 256 }, None);
    let rpc_id = last_request_id(&mock, &peer_q.node_id());

    let packets = [vec![a.clone()], vec![b.clone(), c.clone()], vec![d.clone()]];
    for nodes in packets {
        service.handle_rpc_response(
            peer_q.node_id(),
            rpc_id,
            Response::Nodes {
                total: 3,
                nodes,
            },
        );
    }

    // one discovered set carrying all four records
    let discovered: Vec<Enr> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            Event::Discovered(enr) => Some(enr),
            _ => None,
        })
        .collect();
    assert_eq!(discovered, vec![a, b, c, d]);

    // the registry contains no entry for the request afterwards
    assert!(service.active_requests.is_empty());
    assert!(service.active_nodes_responses.is_empty());
}

#[tokio::test]
async fn nodes_reassembly_caps_at_five_packets() {
    let (_key, local_enr) = build_enr(4005);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);
    let mut events = attach_event_stream(&mut service);

    let (_qk, peer_q) = build_enr(4105);
    service.add_enr(peer_q.clone());

    let local_key: Key<NodeId> = service.local_enr.read().node_id().into();
    let records: Vec<Enr> = (0..6)
        .map(|i| enr_at_distance(&local_key, 256, 5200 + i))
        .collect();

    service.send_rpc_request(&peer_q.node_id(), Request::FindNode { distance: 256 }, None);
    let rpc_id = last_request_id(&mock, &peer_q.node_id());

    for (i, enr) in records.iter().enumerate() {
        service.handle_rpc_response(
            peer_q.node_id(),
            rpc_id,
            Response::Nodes {
                total: 8,
                nodes: vec![enr.clone()],
            },
        );
        if i < 4 {
            // still accumulating
            assert!(service.active_requests.contains_key(&rpc_id));
        } else {
            // finalized at the fifth packet; later packets match no request
            assert!(!service.active_requests.contains_key(&rpc_id));
        }
    }

    let discovered = drain_events(&mut events)
        .into_iter()
        .filter(|event| matches!(event, Event::Discovered(_)))
        .count();
    assert_eq!(discovered, 5);
}

#[tokio::test]
async fn established_session_pings_and_arms_keepalive() {
    let (_key, local_enr) = build_enr(4006);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let (_ak, peer_a) = build_enr(4106);
    service.inject_session_established(peer_a.clone());

    // exactly one PING was sent within the handler
    let pings: Vec<RpcId> = mock
        .sent()
        .iter()
        .filter_map(|out| match out {
            Outbound::Request { dst, message } if *dst == peer_a.node_id() => {
                match &message.body {
                    RpcType::Request(Request::Ping { .. }) => Some(message.id),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect();
    assert_eq!(pings.len(), 1);
    assert!(service.peers_to_ping.contains(&peer_a.node_id()));

    let key = kbucket::Key::from(peer_a.node_id());
    match service.kbuckets.write().entry(&key) {
        kbucket::Entry::Present(_, status) => assert_eq!(status, NodeStatus::Connected),
        _ => panic!("Peer should be in the table"),
    }

    // the PING fails: the peer is disconnected and leaves the keep-alive set
    service.rpc_failure(peer_a.node_id(), pings[0]);
    assert!(!service.peers_to_ping.contains(&peer_a.node_id()));
    match service.kbuckets.write().entry(&key) {
        kbucket::Entry::Present(_, status) => assert_eq!(status, NodeStatus::Disconnected),
        _ => panic!("Peer should remain in the table"),
    };
}

#[tokio::test]
async fn eviction_applies_after_failed_challenge() {
    let (_key, local_enr) = build_enr(4007);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let local_key: Key<NodeId> = service.local_enr.read().node_id().into();
    let mut members = Vec::new();
    for i in 0..kbucket::MAX_NODES_PER_BUCKET as u16 {
        let enr = enr_at_distance(&local_key, 256, 5300 + i);
        service.connection_updated(enr.node_id(), Some(enr.clone()), NodeStatus::Connected);
        members.push(enr);
    }
    let victim = members[0].clone();

    // A seventeenth record starts a challenge: the oldest connected entry is pinged.
    let candidate = enr_at_distance(&local_key, 256, 5350);
    service.connection_updated(
        candidate.node_id(),
        Some(candidate.clone()),
        NodeStatus::Connected,
    );
    let ping_id = last_request_id(&mock, &victim.node_id());

    // The challenge PING fails; the victim is marked disconnected.
    service.rpc_failure(victim.node_id(), ping_id);

    // After the pending timeout, the candidate replaces the victim.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let applied = service
        .kbuckets
        .write()
        .take_applied_pending()
        .expect("Eviction applied");
    assert_eq!(applied.inserted.value, candidate);
    assert_eq!(applied.evicted.map(|node| node.value), Some(victim));
}

#[tokio::test]
async fn incoming_ping_from_unknown_node_requests_enr() {
    let (_key, local_enr) = build_enr(4008);
    let local_seq = local_enr.seq();
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let peer = NodeId::random();
    service.handle_rpc_request(src_socket(), peer, 11, Request::Ping { enr_seq: 1 });

    let sent = mock.sent();
    assert_eq!(sent.len(), 2);
    // the sender is unknown, so its ENR is requested over the observed socket
    match &sent[0] {
        Outbound::RequestUnknownEnr { dst_id, message } => {
            assert_eq!(*dst_id, peer);
            assert_eq!(
                message.body,
                RpcType::Request(Request::FindNode { distance: 0 })
            );
        }
        other => panic!("{:?}", other),
    }
    // and a PONG echoing the observed address is always sent
    match &sent[1] {
        Outbound::Response { message, .. } => {
            assert_eq!(message.id, 11);
            assert_eq!(
                message.body,
                RpcType::Response(Response::Pong {
                    enr_seq: local_seq,
                    ip: src_socket().ip(),
                    port: src_socket().port(),
                })
            );
        }
        other => panic!("{:?}", other),
    }
}

#[tokio::test]
async fn incoming_ping_with_known_record_only_pongs() {
    let (_key, local_enr) = build_enr(4009);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let (_pk, peer) = build_enr(4109);
    service.add_enr(peer.clone());

    service.handle_rpc_request(
        src_socket(),
        peer.node_id(),
        12,
        Request::Ping {
            enr_seq: peer.seq(),
        },
    );

    // the record is current: a single PONG, no ENR request
    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Outbound::Response { .. }));
}

#[tokio::test]
async fn pong_with_newer_seq_requests_enr_update() {
    let (_key, local_enr) = build_enr(4010);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let (_pk, peer) = build_enr(4110);
    service.add_enr(peer.clone());

    // register an outstanding PING
    service.send_ping(&peer.node_id());
    let rpc_id = last_request_id(&mock, &peer.node_id());
    mock.take_sent();

    service.handle_rpc_response(
        peer.node_id(),
        rpc_id,
        Response::Pong {
            enr_seq: peer.seq() + 1,
            ip: src_socket().ip(),
            port: src_socket().port(),
        },
    );

    // a newer record exists: request it with a distance-0 FINDNODE
    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Outbound::Request { dst, message } => {
            assert_eq!(*dst, peer.node_id());
            assert_eq!(
                message.body,
                RpcType::Request(Request::FindNode { distance: 0 })
            );
        }
        other => panic!("{:?}", other),
    }

    // and the responder is now marked connected
    let key = kbucket::Key::from(peer.node_id());
    match service.kbuckets.write().entry(&key) {
        kbucket::Entry::Present(_, status) => assert_eq!(status, NodeStatus::Connected),
        _ => panic!("Peer should be in the table"),
    };
}

#[tokio::test]
async fn mismatched_response_kind_clears_the_request() {
    let (_key, local_enr) = build_enr(4011);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);
    let mut events = attach_event_stream(&mut service);

    let (_pk, peer) = build_enr(4111);
    service.add_enr(peer.clone());
    drain_events(&mut events);

    service.send_rpc_request(&peer.node_id(), Request::FindNode { distance: 256 }, None);
    let rpc_id = last_request_id(&mock, &peer.node_id());

    // a PONG does not answer a FINDNODE
    service.handle_rpc_response(
        peer.node_id(),
        rpc_id,
        Response::Pong {
            enr_seq: 1,
            ip: src_socket().ip(),
            port: src_socket().port(),
        },
    );

    assert!(service.active_requests.is_empty());
    assert!(drain_events(&mut events).is_empty());
}

#[tokio::test]
async fn response_from_unexpected_node_keeps_the_request() {
    let (_key, local_enr) = build_enr(4012);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let (_pk, peer) = build_enr(4112);
    service.add_enr(peer.clone());

    service.send_rpc_request(&peer.node_id(), Request::Ping { enr_seq: 1 }, None);
    let rpc_id = last_request_id(&mock, &peer.node_id());

    let imposter = NodeId::random();
    service.handle_rpc_response(
        imposter,
        rpc_id,
        Response::Pong {
            enr_seq: 1,
            ip: src_socket().ip(),
            port: src_socket().port(),
        },
    );

    // the registry still holds the request for the genuine responder
    assert!(service.active_requests.contains_key(&rpc_id));
}

#[tokio::test]
async fn unknown_rpc_id_is_ignored() {
    let (_key, local_enr) = build_enr(4013);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    service.handle_rpc_response(
        NodeId::random(),
        42,
        Response::Pong {
            enr_seq: 1,
            ip: src_socket().ip(),
            port: src_socket().port(),
        },
    );
    assert!(service.active_requests.is_empty());
    assert!(mock.sent().is_empty());
}

#[tokio::test]
async fn whoareyou_replies_with_best_known_record() {
    let (_key, local_enr) = build_enr(4014);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);

    let (_pk, peer) = build_enr(4114);
    service.add_enr(peer.clone());

    service.handle_whoareyou_request(src_socket(), peer.node_id(), [1u8; AUTH_TAG_LENGTH]);
    match &mock.take_sent()[0] {
        Outbound::WhoAreYou { dst_id, enr_seq, enr } => {
            assert_eq!(*dst_id, peer.node_id());
            assert_eq!(*enr_seq, peer.seq());
            assert_eq!(enr.as_ref(), Some(&peer));
        }
        other => panic!("{:?}", other),
    }

    // an unknown node gets sequence number 0 and no record
    let unknown = NodeId::random();
    service.handle_whoareyou_request(src_socket(), unknown, [2u8; AUTH_TAG_LENGTH]);
    match &mock.take_sent()[0] {
        Outbound::WhoAreYou { dst_id, enr_seq, enr } => {
            assert_eq!(*dst_id, unknown);
            assert_eq!(*enr_seq, 0);
            assert!(enr.is_none());
        }
        other => panic!("{:?}", other),
    }
}

#[tokio::test]
async fn failed_findnode_preserves_partial_results() {
    let (_key, local_enr) = build_enr(4015);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);
    let mut events = attach_event_stream(&mut service);

    let local_key: Key<NodeId> = service.local_enr.read().node_id().into();
    let partial = enr_at_distance(&local_key, 256, 5400);
    let peer = NodeId::random();

    service.active_requests.insert(
        21,
        ActiveRequest {
            node_id: peer,
            request: Request::FindNode { distance: 256 },
            lookup_id: None,
        },
    );
    service.active_nodes_responses.insert(
        21,
        NodesResponse {
            count: 2,
            received_nodes: vec![partial.clone()],
        },
    );

    service.rpc_failure(peer, 21);

    // the partially received records are still reported as discovered
    let discovered: Vec<Event> = drain_events(&mut events);
    assert_eq!(discovered, vec![Event::Discovered(partial)]);
    assert!(service.active_requests.is_empty());
    assert!(service.active_nodes_responses.is_empty());
}

#[tokio::test]
async fn repeated_add_enr_with_equal_seq_is_a_no_op() {
    let (_key, local_enr) = build_enr(4016);
    let mock = MockSession::default();
    let mut service = build_service(local_enr, &mock);
    let mut events = attach_event_stream(&mut service);

    let (_pk, peer) = build_enr(4116);
    service.add_enr(peer.clone());
    assert_eq!(
        drain_events(&mut events),
        vec![Event::EnrAdded {
            enr: peer.clone(),
            replaced: None
        }]
    );

    // the same record again emits nothing
    service.add_enr(peer);
    assert!(drain_events(&mut events).is_empty());
}

#[tokio::test]
async fn find_node_lookup_completes_via_service_task() {
    init();
    let (key, local_enr) = build_enr(4017);
    let mock = MockSession::default();
    let mut discv5 = Discv5::new(local_enr, key, ConfigBuilder::new().build()).unwrap();
    discv5.start(Box::new(mock.clone())).await.unwrap();

    let (_pk, peer) = build_enr(4117);
    discv5.add_enr(peer.clone()).unwrap();

    let target = NodeId::random();
    let lookup = discv5.find_node(target);

    // answer every FINDNODE probe with an empty NODES response until the lookup
    // exhausts its candidates and resolves
    let found = timeout(Duration::from_secs(10), async {
        let respond = async {
            loop {
                for out in mock.take_sent() {
                    if let Outbound::Request { dst, message } = out {
                        if matches!(
                            message.body,
                            RpcType::Request(Request::FindNode { .. })
                        ) {
                            mock.inject(SessionEvent::Message {
                                src_id: dst,
                                src: src_socket(),
                                message: Box::new(ProtocolMessage::response(
                                    message.id,
                                    Response::Nodes {
                                        total: 1,
                                        nodes: Vec::new(),
                                    },
                                )),
                            })
                            .await;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::select! {
            result = lookup => result,
            _ = respond => unreachable!("The responder never finishes"),
        }
    })
    .await
    .expect("The lookup resolves")
    .expect("The service is running");

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].node_id(), peer.node_id());
    discv5.shutdown();
}
