//! The boundary to the session layer.
//!
//! Session establishment, the WHOAREYOU handshake and AEAD sealing happen below this
//! crate. The service treats the session layer as a sink that accepts requests and
//! responses, and as an emitter of decrypted messages and session events. Both
//! directions are captured here: the [`SessionService`] trait for the outbound sink and
//! [`SessionEvent`] for the inbound stream obtained from [`SessionService::start`].

use crate::{
    error::{Error, RequestError},
    rpc::{ProtocolMessage, RpcId},
    Enr,
};
use enr::NodeId;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// The length of the nonce identifying an encrypted session frame.
pub const AUTH_TAG_LENGTH: usize = 12;

/// Nonce identifying an encrypted session frame. Relayed back in WHOAREYOU challenges.
pub type AuthTag = [u8; AUTH_TAG_LENGTH];

/// Events the session layer emits to the service.
#[derive(Debug)]
pub enum SessionEvent {
    /// A session has been established with a node.
    Established(Enr),

    /// A message was received and decrypted.
    Message {
        src_id: NodeId,
        src: SocketAddr,
        message: Box<ProtocolMessage>,
    },

    /// A WHOAREYOU packet needs to be sent. This requests the service to look up the
    /// highest known ENR for the node.
    WhoAreYouRequest {
        src: SocketAddr,
        src_id: NodeId,
        auth_tag: AuthTag,
    },

    /// An RPC request failed: a session could not be established or the request timed out
    /// after the session layer's retries.
    RequestFailed(NodeId, RpcId),
}

/// The session layer as seen by the service.
///
/// All send methods may fail synchronously; such failures are logged and swallowed by
/// the service, which records no outstanding request for them. Asynchronous failures are
/// reported through [`SessionEvent::RequestFailed`]. The session layer owns all
/// per-request timers; the service runs none of its own.
pub trait SessionService: Send {
    /// Starts the session layer's tasks, returning the stream of session events.
    fn start(&mut self) -> BoxFuture<'static, Result<mpsc::Receiver<SessionEvent>, Error>>;

    /// Shuts the session layer down, dropping all established sessions.
    fn stop(&mut self) -> BoxFuture<'static, ()>;

    /// Sends a request to a node, establishing a session if one does not exist.
    fn send_request(&mut self, dst_enr: &Enr, message: ProtocolMessage)
        -> Result<(), RequestError>;

    /// Sends a response to a node over an established session. Responses go to the socket
    /// address the corresponding request arrived from.
    fn send_response(
        &mut self,
        dst: SocketAddr,
        dst_id: &NodeId,
        message: ProtocolMessage,
    ) -> Result<(), RequestError>;

    /// Sends a request to a node whose ENR is not known, addressed by socket only. Used to
    /// fetch the ENR of a node we have an address for but no record of.
    fn send_request_unknown_enr(
        &mut self,
        dst: SocketAddr,
        dst_id: &NodeId,
        message: ProtocolMessage,
    ) -> Result<(), RequestError>;

    /// Answers a [`SessionEvent::WhoAreYouRequest`] with the highest known ENR for the
    /// node, or `enr_seq` 0 and no record if the node is unknown.
    fn send_whoareyou(
        &mut self,
        dst: SocketAddr,
        dst_id: &NodeId,
        enr_seq: u64,
        remote_enr: Option<Enr>,
        auth_tag: AuthTag,
    );

    /// Informs the session layer of a newly observed ENR, possibly refreshing a live
    /// session's record.
    fn update_enr(&mut self, enr: Enr);
}
