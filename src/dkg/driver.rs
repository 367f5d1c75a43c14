//! Orchestration around the DKG sub-protocol.
//!
//! The driver runs the sub-protocol exactly once per group lifetime:
//! `Idle -> Running -> {Done | Failed}`. The leader enters `Running` through
//! [`DkgDriver::start`]; a follower enters it when the first inbound packet
//! arrives. Terminal states are final and the outcome is observable exactly
//! once, through the receiver returned by `start`.

use super::{bundle_from_proto, bundle_to_proto, DkgError, DkgGateway};
use crate::key::group::{Group, Node};
use crate::key::keys::DistPublic;
use crate::key::Scheme;
use crate::protobuf::quorand::DkgPacket;

use energon::kyber::dkg::{
    BundleSender, Config, DistKeyShare, DkgOutput, Node as DkgNode, Protocol,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, Span};

/// Time budget of each sub-protocol phase. The sub-protocol moves on as soon
/// as all packets of a phase arrived, so this only bounds the unhappy path.
const DKG_PHASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Successful outcome: the node's share, the distributed public key and the
/// qualified group reported by the sub-protocol.
pub struct DkgResult<S: Scheme> {
    pub share: DistKeyShare<S>,
    pub dist_public: DistPublic<S>,
    pub qualified: Group<S>,
}

/// Handle of a running DKG. Dropping it closes the inbound packet path.
pub struct DkgDriver<S: Scheme> {
    bundles_tx: BundleSender<S>,
}

impl<S: Scheme> DkgDriver<S> {
    /// Spawns the sub-protocol and its outbound packet pump. The sub-protocol
    /// broadcasts its first packet as soon as it runs, which on the leader is
    /// the packet that wakes up every follower.
    pub fn start<G: DkgGateway<S>>(
        private: &S::Scalar,
        group: &Group<S>,
        our_key_index: u32,
        timeout: Duration,
        gateway: Arc<G>,
        tracker: &TaskTracker,
        l: &Span,
    ) -> Result<(Self, oneshot::Receiver<Result<DkgResult<S>, DkgError>>), DkgError> {
        let new_nodes: Vec<DkgNode<S>> = group
            .nodes
            .iter()
            .map(|node| DkgNode {
                index: node.index(),
                public: node.identity().key().to_owned(),
            })
            .collect();

        let dkg_log = tracing::info_span!(parent: l, "dkg", index = our_key_index);
        let config = Config {
            long_term: private.to_owned(),
            old_nodes: vec![],
            new_nodes,
            public_coeffs: vec![],
            share: None,
            threshold: group.threshold,
            old_threshold: 0,
            nonce: group.nonce(),
            log: dkg_log.clone(),
        };

        let (protocol, mut bundles_rx, bundles_tx) =
            Protocol::new_dkg(config, DKG_PHASE_TIMEOUT)
                .map_err(|err| DkgError::Failed(err.to_string()))?;

        // Outbound pump: every bundle the sub-protocol emits goes to all
        // other group members through the gateway.
        let peers: Vec<_> = group
            .nodes
            .iter()
            .filter(|node| node.index() != our_key_index)
            .map(|node| node.identity().clone())
            .collect();
        let pump_log = dkg_log.clone();
        tracker.spawn(async move {
            while let Some(bundle) = bundles_rx.recv().await {
                let packet = match bundle_to_proto(bundle) {
                    Ok(packet) => packet,
                    Err(err) => {
                        error!(parent: &pump_log, "failed to convert outbound bundle: {err}");
                        continue;
                    }
                };
                for peer in &peers {
                    let gateway = Arc::clone(&gateway);
                    let peer = peer.clone();
                    let packet = packet.clone();
                    let l = pump_log.clone();
                    tokio::spawn(async move {
                        if let Err(err) = gateway.send(&peer, packet).await {
                            debug!(parent: &l, "dkg send to {}: {err}", peer.address());
                        }
                    });
                }
            }
        });

        // The driver owns the total timeout; the sub-protocol only knows its
        // per-phase budget.
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let group_for_outcome = group.clone();
        tracker.spawn(async move {
            let outcome = tokio::select! {
                out = protocol.run() => match out {
                    Ok(Some(output)) => {
                        info!(parent: &dkg_log, "dkg finished successfully");
                        qualified_result(output, &group_for_outcome)
                    }
                    Ok(None) => Err(DkgError::Failed("node left the group".into())),
                    Err(err) => Err(DkgError::Failed(err.to_string())),
                },
                () = tokio::time::sleep(timeout) => {
                    error!(parent: &dkg_log, "dkg timed out after {timeout:?}");
                    Err(DkgError::Timeout)
                }
            };

            let _ = outcome_tx.send(outcome);
        });

        Ok((Self { bundles_tx }, outcome_rx))
    }

    /// Feeds an inbound packet into the sub-protocol. Bounded handoff: the
    /// await ends once the sub-protocol accepted the bundle.
    pub async fn process(&self, packet: DkgPacket) -> Result<(), DkgError> {
        let bundle = bundle_from_proto::<S>(packet)?;
        self.bundles_tx
            .send(bundle)
            .await
            .map_err(|_| DkgError::NotRunning)
    }
}

/// Maps the sub-protocol output back onto group identities. Only qualified
/// members survive, keeping their original indices.
fn qualified_result<S: Scheme>(
    output: DkgOutput<S>,
    group: &Group<S>,
) -> Result<DkgResult<S>, DkgError> {
    let DkgOutput { qual, key } = output;

    let mut nodes = Vec::with_capacity(qual.len());
    for qual_node in &qual {
        let node = group
            .node(qual_node.index)
            .ok_or_else(|| DkgError::Failed(format!("unknown qualified index {}", qual_node.index)))?;
        nodes.push(Node::new(node.identity().clone(), qual_node.index));
    }
    nodes.sort_by_key(Node::index);

    let qualified = Group::new(nodes, group.threshold)
        .map_err(|err| DkgError::Failed(err.to_string()))?;
    let dist_public = DistPublic::new(key.commits.clone());

    Ok(DkgResult {
        share: key,
        dist_public,
        qualified,
    })
}
