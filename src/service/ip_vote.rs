use enr::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a peer's report of our external address stays current.
pub const IP_VOTE_TIMEOUT: Duration = Duration::from_secs(300);

/// External-address reports collected from PONG responses.
///
/// Each peer holds at most one live report. Reports are recorded on every PONG;
/// turning the current agreement into a local record update is a future extension,
/// so nothing here feeds back into the ENR yet.
pub(crate) struct IpVote {
    /// The latest report of each peer, with its expiry.
    reports: HashMap<NodeId, AddressReport>,
    /// Number of agreeing peers required before an address is considered ours.
    quorum: usize,
    /// How long a single report remains counted.
    ttl: Duration,
}

struct AddressReport {
    addr: SocketAddr,
    expires: Instant,
}

impl IpVote {
    pub fn new(quorum: usize) -> Self {
        // a single peer must never be able to decide our external address
        assert!(quorum >= 2, "external address quorum must be at least 2");
        IpVote {
            reports: HashMap::new(),
            quorum,
            ttl: IP_VOTE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_ttl(quorum: usize, ttl: Duration) -> Self {
        let mut votes = Self::new(quorum);
        votes.ttl = ttl;
        votes
    }

    /// Records `peer`'s view of our external address, superseding any earlier report
    /// from the same peer.
    pub fn record(&mut self, peer: NodeId, addr: SocketAddr) {
        let expires = Instant::now() + self.ttl;
        self.reports.insert(peer, AddressReport { addr, expires });
    }

    /// The address the most peers currently agree on, provided the agreement reaches
    /// the quorum. Expired reports are pruned along the way.
    pub fn best(&mut self) -> Option<SocketAddr> {
        let now = Instant::now();
        self.reports.retain(|_, report| now < report.expires);

        let mut tally: HashMap<SocketAddr, usize> = HashMap::new();
        for report in self.reports.values() {
            *tally.entry(report.addr).or_default() += 1;
        }

        tally
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .filter(|(_, count)| *count >= self.quorum)
            .map(|(addr, _)| addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new("192.0.2.1".parse().unwrap(), port)
    }

    #[test]
    fn no_agreement_below_quorum() {
        let mut votes = IpVote::new(2);
        votes.record(NodeId::random(), addr(1));
        votes.record(NodeId::random(), addr(2));
        votes.record(NodeId::random(), addr(3));
        assert_eq!(votes.best(), None);
    }

    #[test]
    fn quorum_agreement_wins() {
        let mut votes = IpVote::new(2);
        votes.record(NodeId::random(), addr(1));
        votes.record(NodeId::random(), addr(7));
        votes.record(NodeId::random(), addr(7));
        assert_eq!(votes.best(), Some(addr(7)));
    }

    #[test]
    fn a_peer_cannot_vote_twice() {
        let mut votes = IpVote::new(2);
        let flip_flopper = NodeId::random();
        votes.record(flip_flopper, addr(1));
        votes.record(flip_flopper, addr(1));
        votes.record(NodeId::random(), addr(9));
        // the repeated report counts once, so no address reaches the quorum
        assert_eq!(votes.best(), None);
    }

    #[test]
    fn expired_reports_are_pruned() {
        let mut votes = IpVote::with_ttl(2, Duration::from_millis(1));
        votes.record(NodeId::random(), addr(4));
        votes.record(NodeId::random(), addr(4));
        std::thread::sleep(Duration::from_millis(5));
        votes.record(NodeId::random(), addr(5));
        assert_eq!(votes.best(), None);
    }
}
