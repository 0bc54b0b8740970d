//! The user-facing handle of the discovery service.
//!
//! A [`Discv5`] struct is created with the local ENR and its key. Once created, the
//! service is started with [`Discv5::start`], handing it the session layer it should
//! speak through; this spawns the service task in the background. The service can be
//! shut down with [`Discv5::shutdown`].

use crate::{
    error::{Error, LookupError},
    kbucket::{self, Entry, KBucketsTable, NodeStatus},
    service::{Event, Service, ServiceRequest},
    Config, Enr, SessionService,
};
use enr::{CombinedKey, EnrError, EnrKey, NodeId};
use parking_lot::RwLock;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// The timeout window of the pending slot of each bucket, within which a challenged
/// entry may prove its liveness.
const BUCKET_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

/// The main discovery service handle. This provides the user-level API for starting and
/// stopping the underlying service task, running lookups and inspecting the routing
/// table.
pub struct Discv5 {
    config: Config,
    /// The channel to make requests from the main service.
    service_channel: Option<mpsc::Sender<ServiceRequest>>,
    /// The exit channel to shutdown the underlying service.
    service_exit: Option<oneshot::Sender<()>>,
    /// The routing table of the discovery service.
    kbuckets: Arc<RwLock<KBucketsTable<NodeId, Enr>>>,
    /// The local ENR of the server.
    local_enr: Arc<RwLock<Enr>>,
    /// The key associated with the local ENR, required for updating the local ENR.
    enr_key: Arc<RwLock<CombinedKey>>,
}

impl Discv5 {
    pub fn new(
        local_enr: Enr,
        enr_key: CombinedKey,
        mut config: Config,
    ) -> Result<Self, &'static str> {
        // ensure the keypair matches the one that signed the enr.
        if local_enr.public_key() != enr_key.public() {
            return Err("Provided keypair does not match the provided ENR");
        }

        // If an executor is not provided, assume a current tokio runtime is running.
        if config.executor.is_none() {
            config.executor = Some(Box::new(crate::executor::TokioExecutor::default()));
        };

        let node_id = local_enr.node_id();
        let local_enr = Arc::new(RwLock::new(local_enr));
        let enr_key = Arc::new(RwLock::new(enr_key));
        let kbuckets = Arc::new(RwLock::new(KBucketsTable::new(
            node_id.into(),
            BUCKET_PENDING_TIMEOUT,
        )));

        Ok(Discv5 {
            config,
            service_channel: None,
            service_exit: None,
            kbuckets,
            local_enr,
            enr_key,
        })
    }

    /// Starts the service task, speaking through the given session layer.
    pub async fn start(&mut self, session: Box<dyn SessionService>) -> Result<(), Error> {
        if self.service_channel.is_some() {
            warn!("Service is already started");
            return Err(Error::ServiceAlreadyStarted);
        }

        let (service_exit, service_channel) = Service::spawn(
            self.local_enr.clone(),
            self.kbuckets.clone(),
            self.config.clone(),
            session,
        )
        .await?;
        self.service_exit = Some(service_exit);
        self.service_channel = Some(service_channel);
        Ok(())
    }

    /// Terminates the service. Idempotent: subsequent calls are no-ops.
    pub fn shutdown(&mut self) {
        if let Some(exit) = self.service_exit.take() {
            if exit.send(()).is_err() {
                debug!("Service already shut down");
            }
            self.service_channel = None;
        } else {
            debug!("Service is already shut down");
        }
    }

    /// Adds a known ENR of a peer participating in discovery to the routing table.
    ///
    /// This allows pre-populating the routing table with known addresses, so that they
    /// can be used immediately in following lookups involving one of these peers,
    /// without having to dial them upfront.
    pub fn add_enr(&self, enr: Enr) -> Result<(), &'static str> {
        // only add ENR's that have a valid udp socket.
        if enr.udp4_socket().is_none() && enr.udp6_socket().is_none() {
            warn!("ENR attempted to be added without a UDP socket has been ignored");
            return Err("ENR has no UDP socket to connect to");
        }

        let channel = self
            .service_channel
            .as_ref()
            .ok_or("Service not started")?;
        channel
            .try_send(ServiceRequest::AddEnr(enr))
            .map_err(|_| "Service channel full or closed")
    }

    /// Returns the local ENR of the node.
    pub fn local_enr(&self) -> Enr {
        self.local_enr.read().clone()
    }

    /// Allows the application layer to insert an arbitrary field into the local ENR.
    /// Connected peers are pinged so they fetch the bumped sequence number.
    pub fn enr_insert(&self, key: &str, value: &[u8]) -> Result<Option<Vec<u8>>, EnrError> {
        let result = self
            .local_enr
            .write()
            .insert(key, &value, &self.enr_key.read())
            .map(|v| v.map(|v| v.to_vec()));

        if result.is_ok() {
            if let Some(channel) = self.service_channel.as_ref() {
                let _ = channel.try_send(ServiceRequest::PingConnectedPeers);
            }
        }
        result
    }

    /// Returns an ENR if one is known for the given NodeId.
    pub fn find_enr(&self, node_id: &NodeId) -> Option<Enr> {
        let key = kbucket::Key::from(*node_id);
        if let Entry::Present(mut entry, _) = self.kbuckets.write().entry(&key) {
            return Some(entry.value().clone());
        }
        None
    }

    /// Returns the number of connected peers that exist in the routing table.
    pub fn connected_peers(&self) -> usize {
        self.kbuckets
            .write()
            .iter()
            .filter(|node| node.status == NodeStatus::Connected)
            .count()
    }

    /// Returns the node ids of all nodes currently contained in the routing table.
    pub fn table_entries_id(&self) -> Vec<NodeId> {
        self.kbuckets
            .write()
            .iter()
            .map(|node| *node.key.preimage())
            .collect()
    }

    /// Returns the ENR's of all nodes currently contained in the routing table.
    pub fn table_entries_enr(&self) -> Vec<Enr> {
        self.kbuckets
            .write()
            .iter()
            .map(|node| node.value.clone())
            .collect()
    }

    /// Runs an iterative FINDNODE lookup.
    ///
    /// This will return the contactable records of the DHT closest to the requested
    /// `NodeId`. Once the lookup has started it resolves with whatever subset of
    /// records could be found, never an error.
    ///
    /// Note: The async syntax is forgone here in order to create `'static` futures,
    /// where the underlying sending channel is cloned.
    pub fn find_node(
        &self,
        target: NodeId,
    ) -> impl Future<Output = Result<Vec<Enr>, LookupError>> + 'static {
        let channel = self.clone_channel();

        async move {
            let channel = channel.map_err(|_| LookupError::ServiceNotStarted)?;
            let (callback_send, callback_recv) = oneshot::channel();

            let request = ServiceRequest::FindNode {
                target,
                callback: callback_send,
            };
            channel
                .send(request)
                .await
                .map_err(|_| LookupError::ChannelFailed("Service channel closed".into()))?;

            callback_recv
                .await
                .map_err(|e| LookupError::ChannelFailed(e.to_string()))
        }
    }

    /// Creates an event stream channel which can be polled to receive service events.
    pub fn event_stream(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<Event>, Error>> + 'static {
        let channel = self.clone_channel();

        async move {
            let channel = channel?;
            let (callback_send, callback_recv) = oneshot::channel();

            let request = ServiceRequest::RequestEventStream(callback_send);
            channel
                .send(request)
                .await
                .map_err(|_| Error::ServiceChannelClosed)?;

            callback_recv.await.map_err(|_| Error::ServiceChannelClosed)
        }
    }

    /// Internal helper function to send requests to the service.
    fn clone_channel(&self) -> Result<mpsc::Sender<ServiceRequest>, Error> {
        if let Some(channel) = self.service_channel.as_ref() {
            Ok(channel.clone())
        } else {
            Err(Error::ServiceNotStarted)
        }
    }
}

impl Drop for Discv5 {
    fn drop(&mut self) {
        self.shutdown();
    }
}
