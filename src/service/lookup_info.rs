use crate::kbucket::Key;
use crate::lookup::ProbePeer;
use crate::rpc::Request;
use crate::Enr;
use enr::NodeId;
use smallvec::SmallVec;
use tokio::sync::oneshot;

/// How many times a lookup probes the same peer, each probe asking for a different
/// distance shell. A single shell holds only a slice of the peer's neighbourhood, so
/// widening over a few shells makes it far less likely that a relevant record is
/// missed.
pub(crate) const MAX_FINDNODE_PROBES: usize = 3;

/// The target and bookkeeping of a single lookup.
#[derive(Debug)]
pub struct LookupInfo {
    /// The node id being searched for.
    pub target: NodeId,

    /// Temporary ENRs used when trying to reach nodes discovered during the lookup that
    /// are not (yet) in the routing table. Deduplicated by node id.
    pub untrusted_enrs: SmallVec<[Enr; 16]>,

    /// The channel the final set of found records is delivered over.
    pub callback: oneshot::Sender<Vec<Enr>>,
}

impl LookupInfo {
    /// Builds the FINDNODE request for a probe of this lookup. Fails if the probed peer
    /// is the target itself.
    pub fn rpc_request(&self, probe: &ProbePeer<NodeId>) -> Result<Request, &'static str> {
        let distance =
            probe_distance(&self.target, probe).ok_or("Requested a node to find itself")?;
        Ok(Request::FindNode { distance })
    }
}

/// The distance to request from a peer on the given probe attempt.
///
/// The first attempt asks the peer for exactly the shell the target falls into from the
/// peer's point of view. Later attempts widen the search to the neighbouring shells,
/// alternating one above and one below and stepping further out each round, always
/// staying inside the valid `1..=256` range (shell 0 would only return the peer's own
/// record). A base distance of 12 therefore produces the attempt sequence
/// 12, 13, 11, 14, 10, ...
///
/// Returns `None` when the peer is the target itself, or when the attempt number walks
/// past the last reachable shell.
fn probe_distance(target: &NodeId, probe: &ProbePeer<NodeId>) -> Option<u64> {
    let peer_key: Key<NodeId> = probe.node_id.into();
    let base = peer_key.log2_distance(&(*target).into())?;

    let widen = (1..=256u64).flat_map(|step| {
        std::iter::once(base + step)
            .filter(|shell| *shell <= 256)
            .chain(
                base.checked_sub(step)
                    .into_iter()
                    .filter(|shell| *shell >= 1),
            )
    });
    let attempt = probe.iteration.checked_sub(1)?;
    std::iter::once(base).chain(widen).nth(attempt)
}
