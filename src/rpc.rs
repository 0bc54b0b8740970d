//! The protocol-level message model.
//!
//! These types describe the RPC messages exchanged between nodes once a
//! session has been established. The wire encoding (RLP) and the packet
//! framing are the concern of the codec inside the session layer; the
//! service only ever sees decoded messages.

use crate::Enr;
use std::net::IpAddr;

/// The maximum size of a UDP packet.
pub const MAX_PACKET_SIZE: usize = 1280;

/// The maximum wire size of a node record.
pub const MAX_RECORD_SIZE: usize = 300;

/// Bytes of a NODES packet that are not ENR payload: session tag (32), auth tag (12), rpc id
/// (8), total field (8), HMAC (16) and up to 16 bytes of AEAD expansion.
pub const PACKET_OVERHEAD: usize = 92;

/// The number of records that fit a single NODES response packet.
pub const NODES_PER_PACKET: usize = (MAX_PACKET_SIZE - PACKET_OVERHEAD) / MAX_RECORD_SIZE;

/// The maximum number of NODES response packets accepted for a single request.
pub const MAX_NODES_RESPONSES: usize = 5;

/// Type of the identifier correlating a request with its response.
pub type RpcId = u64;

/// A protocol message, either a request or a response, carrying the rpc id that correlates
/// the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub id: RpcId,
    pub body: RpcType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcType {
    Request(Request),
    Response(Response),
}

/// A request sent to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A PING request, advertising our current ENR sequence number.
    Ping { enr_seq: u64 },
    /// A FINDNODE request for all records at the given log2 distance. A distance of 0
    /// requests the recipient's own record.
    FindNode { distance: u64 },
    /// An application-protocol request.
    Talk { protocol: Vec<u8>, request: Vec<u8> },
}

/// A response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A PONG response, echoing the sender's ENR sequence number and the address it
    /// observed for us.
    Pong { enr_seq: u64, ip: IpAddr, port: u16 },
    /// A NODES response. `total` is the number of packets the full response is split
    /// across; each carries the same rpc id.
    Nodes { total: u64, nodes: Vec<Enr> },
    /// An application-protocol response.
    Talk { response: Vec<u8> },
}

impl ProtocolMessage {
    pub fn request(id: RpcId, request: Request) -> Self {
        ProtocolMessage {
            id,
            body: RpcType::Request(request),
        }
    }

    pub fn response(id: RpcId, response: Response) -> Self {
        ProtocolMessage {
            id,
            body: RpcType::Response(response),
        }
    }
}

impl Response {
    /// Determines if this is a valid response kind to the given request kind.
    pub fn match_request(&self, req: &Request) -> bool {
        match self {
            Response::Pong { .. } => matches!(req, Request::Ping { .. }),
            Response::Nodes { .. } => matches!(req, Request::FindNode { .. }),
            Response::Talk { .. } => matches!(req, Request::Talk { .. }),
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Ping { enr_seq } => write!(f, "PING(enr_seq: {enr_seq})"),
            Request::FindNode { distance } => write!(f, "FINDNODE(distance: {distance})"),
            Request::Talk { protocol, .. } => write!(f, "TALKREQ(protocol len: {})", protocol.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn three_records_fit_a_nodes_packet() {
        assert_eq!(NODES_PER_PACKET, 3);
    }

    #[test]
    fn response_kinds_match_their_requests() {
        let pong = Response::Pong {
            enr_seq: 1,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9000,
        };
        let nodes = Response::Nodes {
            total: 1,
            nodes: Vec::new(),
        };

        assert!(pong.match_request(&Request::Ping { enr_seq: 1 }));
        assert!(!pong.match_request(&Request::FindNode { distance: 10 }));
        assert!(nodes.match_request(&Request::FindNode { distance: 10 }));
        assert!(!nodes.match_request(&Request::Ping { enr_seq: 1 }));
    }
}
