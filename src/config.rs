//! A set of configuration parameters to tune the discovery protocol.

use crate::Executor;
use std::time::Duration;

/// Configuration parameters that define the performance of the discovery service.
#[derive(Clone)]
pub struct Config {
    /// The timeout for an entire lookup. Any peers discovered for this lookup are returned.
    /// Default: 60 seconds.
    pub lookup_timeout: Duration,

    /// The timeout after which a peer in an ongoing lookup is marked unresponsive.
    /// Unresponsive peers don't count towards the parallelism limits for a lookup.
    /// Hence, we may potentially end up making more requests to good peers. Default: 2 seconds.
    pub lookup_peer_timeout: Duration,

    /// The number of peers to request in parallel in a single lookup. Default: 3.
    pub lookup_parallelism: usize,

    /// The number of closest peers a completed lookup returns. Default: 16.
    pub lookup_num_results: usize,

    /// The time between pings to ensure connectivity amongst connected nodes.
    /// Default: 300 seconds.
    pub ping_interval: Duration,

    /// Whether to record the external addresses peers report for us in PONG responses.
    /// Default: true.
    pub enr_update: bool,

    /// The minimum number of peers that have to agree on an external address before it is
    /// considered a majority. Default: 10.
    pub enr_peer_update_min: usize,

    /// Reports all discovered ENR's when traversing the DHT to the event stream. Default: true.
    pub report_discovered_peers: bool,

    /// The callback for handling TALKREQ requests. The input to this callback is the protocol
    /// and the request body, the output is the response sent back to the requester.
    pub talkreq_callback: fn(&[u8], &[u8]) -> Vec<u8>,

    /// A custom executor which can spawn the discovery tasks. This must be a tokio runtime,
    /// with timing support. By default, the runtime that created the service will be used.
    pub executor: Option<Box<dyn Executor + Send + Sync>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(60),
            lookup_peer_timeout: Duration::from_secs(2),
            lookup_parallelism: 3,
            lookup_num_results: 16,
            ping_interval: Duration::from_secs(300),
            enr_update: true,
            enr_peer_update_min: 10,
            report_discovered_peers: true,
            talkreq_callback: |_, _| Vec::new(),
            executor: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder::default()
    }

    /// The timeout for an entire lookup. Any peers discovered before this timeout are returned.
    pub fn lookup_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.lookup_timeout = timeout;
        self
    }

    /// The timeout after which a peer in an ongoing lookup is marked unresponsive.
    pub fn lookup_peer_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.lookup_peer_timeout = timeout;
        self
    }

    /// The number of peers to request in parallel in a single lookup.
    pub fn lookup_parallelism(&mut self, parallelism: usize) -> &mut Self {
        self.config.lookup_parallelism = parallelism;
        self
    }

    /// The number of closest peers a completed lookup returns.
    pub fn lookup_num_results(&mut self, num_results: usize) -> &mut Self {
        self.config.lookup_num_results = num_results;
        self
    }

    /// The time between pings to ensure connectivity amongst connected nodes.
    pub fn ping_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.ping_interval = interval;
        self
    }

    /// Disables recording of the external addresses peers report for us.
    pub fn disable_enr_update(&mut self) -> &mut Self {
        self.config.enr_update = false;
        self
    }

    /// The minimum number of peers that have to agree on an external address before it is
    /// considered a majority.
    pub fn enr_peer_update_min(&mut self, min: usize) -> &mut Self {
        // a single peer must never be able to decide our external address
        assert!(min >= 2, "external address quorum must be at least 2");
        self.config.enr_peer_update_min = min;
        self
    }

    /// Disables reporting of discovered peers through the event stream.
    pub fn disable_report_discovered_peers(&mut self) -> &mut Self {
        self.config.report_discovered_peers = false;
        self
    }

    /// The callback function for handling TALKREQ requests.
    pub fn talkreq_callback(&mut self, callback: fn(&[u8], &[u8]) -> Vec<u8>) -> &mut Self {
        self.config.talkreq_callback = callback;
        self
    }

    /// A custom executor which can spawn the discovery tasks. This must be a tokio runtime,
    /// with timing support.
    pub fn executor(&mut self, executor: Box<dyn Executor + Send + Sync>) -> &mut Self {
        self.config.executor = Some(executor);
        self
    }

    pub fn build(&mut self) -> Config {
        // If an executor is not provided, assume a current tokio runtime is running.
        if self.config.executor.is_none() {
            self.config.executor = Some(Box::new(crate::executor::TokioExecutor::default()));
        };
        self.config.clone()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("lookup_timeout", &self.lookup_timeout)
            .field("lookup_peer_timeout", &self.lookup_peer_timeout)
            .field("lookup_parallelism", &self.lookup_parallelism)
            .field("lookup_num_results", &self.lookup_num_results)
            .field("ping_interval", &self.ping_interval)
            .field("enr_update", &self.enr_update)
            .field("enr_peer_update_min", &self.enr_peer_update_min)
            .field("report_discovered_peers", &self.report_discovered_peers)
            .finish()
    }
}
