#![deny(rustdoc::broken_intra_doc_links)]
//! The protocol-level service layer of a [Discovery
//! V5](https://github.com/ethereum/devp2p/blob/master/discv5/discv5.md) node.
//!
//! # Overview
//!
//! Discovery v5 is a UDP-based protocol for encrypted peer discovery. Each peer/node on
//! the network is identified via its ENR ([Ethereum Node
//! Record](https://eips.ethereum.org/EIPS/eip-778)), which is essentially a signed
//! key-value store containing the node's public key and optionally IP address and port.
//!
//! This crate implements the node's protocol-level behaviour: it maintains a
//! kademlia-like routing table of discovered peers, performs bounded-parallelism
//! iterative lookups, answers peer queries, tracks liveness through periodic pings and
//! correlates requests with responses across a lossy network. The session layer
//! (handshakes, WHOAREYOU challenges, packet encryption and the UDP socket) is *not*
//! part of this crate: it is abstracted behind the [`SessionService`] trait and the
//! [`SessionEvent`] stream, so any compatible implementation can drive the service.
//!
//! The crate is split into three main layers:
//!
//! - [`kbucket`]: The XOR-metric routing table. 256 fixed-size buckets of up to 16
//!   records each, with a per-bucket pending slot used to challenge the least-recently
//!   seen entry on capacity overflow.
//! - [`lookup`]: Per-query iterative traversal state machines performing
//!   bounded-parallelism walks over the node-id space.
//! - [`service`]: The dispatcher gluing the two to the session layer. It runs in its
//!   own task and owns all protocol state.
//!
//! [`Discv5`] is the application-level handle: it starts/stops the underlying task,
//! initiates lookups and exposes the routing table contents.
//!
//! ## Events
//!
//! The [`Event`] stream reports discovered records, routing table insertions and
//! evictions, and TALKREQ messages. The stream is obtained from
//! [`Discv5::event_stream`].
//!
//! ## Runtimes
//!
//! The service requires a tokio runtime with timing enabled. An explicit runtime can be
//! given via the configuration; see the [`ConfigBuilder`]. If none is provided, it is
//! assumed that a tokio runtime is ambient when creating the [`Discv5`] struct.

mod config;
mod discv5;
mod error;
mod executor;
pub mod kbucket;
pub mod lookup;
pub mod rpc;
pub mod service;
mod session_service;
mod timer_set;

/// The ENR type of this implementation.
pub type Enr = enr::Enr<enr::CombinedKey>;

pub use crate::discv5::Discv5;
pub use config::{Config, ConfigBuilder};
pub use error::{Error, LookupError, RequestError};
pub use executor::{Executor, TokioExecutor};
pub use kbucket::Key;
pub use service::Event;
pub use session_service::{AuthTag, SessionEvent, SessionService, AUTH_TAG_LENGTH};
pub use timer_set::TimerSet;
// re-export the ENR crate
pub use enr;
