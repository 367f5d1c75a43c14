//! Handler to initiate and react to the tBLS round protocol.
//!
//! Every round has one deterministic leader, `group[round % n]`. The leader
//! solicits partial signatures from the other nodes, aggregates `t` valid
//! ones into the group signature and persists the finalized beacon. The
//! other nodes only answer solicitations; finalization is the leader's job.

use super::store::{BeaconStore, StoreError};
use super::{round_message, Beacon};
use crate::key::group::Group;
use crate::key::keys::DistPublic;
use crate::key::{KeyPoint, Scheme};
use crate::net::protocol::ProtocolClient;
use crate::net::utils::{Address, Callback, ClientTls};
use crate::protobuf::quorand::{BeaconRequest, BeaconResponse};

use energon::kyber::dkg::DistKeyShare;
use energon::kyber::tbls::{self, SigShare, TBlsError};
use energon::traits::Affine;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Span};

#[derive(thiserror::Error, Debug)]
pub enum BeaconError {
    #[error("not ready for round {round}, current round {current}")]
    NotReady { round: u64, current: u64 },
    #[error("received partial with invalid signature")]
    InvalidPartial,
    #[error("partial from index {0} which is not in the group")]
    UnknownIndex(u32),
    #[error("recovered signature does not verify under the group key")]
    AggregateVerifyFailed,
    #[error("round {round}: collected {got} valid partials, needed {need}")]
    NotEnoughPartials { round: u64, got: usize, need: usize },
    #[error("failed to serialize recovered signature")]
    SerializeRecovered,
    #[error("t_bls: {0}")]
    TBls(#[from] TBlsError),
    #[error("beacon store: {0}")]
    Store(#[from] StoreError),
    #[error("beacon handler channel closed unexpectedly")]
    HandlerClosed,
}

pub enum BeaconCmd {
    /// Server-side entry for an incoming partial-signature solicitation.
    Process(BeaconRequest, Callback<BeaconResponse, BeaconError>),
    /// Graceful shutdown; in-flight rounds are abandoned.
    Stop(Callback<(), BeaconError>),
}

/// Remote group member with its verification key, the evaluation of the
/// public polynomial at the member index.
pub struct RoundPeer<S: Scheme> {
    index: u32,
    address: Address,
    vkey: KeyPoint<S>,
    client: ProtocolClient,
}

impl<S: Scheme> RoundPeer<S> {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }
}

pub struct BeaconHandler<S: Scheme> {
    share: DistKeyShare<S>,
    group: Group<S>,
    public_key: KeyPoint<S>,
    our_index: u32,
    peers: Arc<Vec<RoundPeer<S>>>,
    store: BeaconStore,
    period: Duration,
    seed: Vec<u8>,
    /// Round executed at the upcoming tick; `next_round - 1` is the round
    /// currently in progress.
    next_round: u64,
    /// Per-peer misbehavior count, observability only.
    invalid_partials: Arc<AtomicU64>,
    l: Span,
}

impl<S: Scheme> BeaconHandler<S> {
    /// Wires the handler and spawns its driver task. Returns the command
    /// sender used by the transport layer.
    #[allow(clippy::too_many_arguments, reason = "dkg output is naturally wide")]
    pub fn start(
        share: DistKeyShare<S>,
        group: Group<S>,
        dist: &DistPublic<S>,
        store: BeaconStore,
        period: Duration,
        seed: Vec<u8>,
        catchup_round: Option<u64>,
        certs_dir: Option<ClientTls>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        l: Span,
    ) -> anyhow::Result<mpsc::Sender<BeaconCmd>> {
        let our_index = share.pri_share.index();
        let poly = dist.poly();

        let mut peers = Vec::with_capacity(group.len().saturating_sub(1));
        for node in group.nodes.iter().filter(|n| n.index() != our_index) {
            let tls = node.identity().tls().then(|| certs_dir.clone().unwrap_or_default());
            let client = ProtocolClient::lazy(node.identity().address(), tls.as_ref())?;
            peers.push(RoundPeer {
                index: node.index(),
                address: node.identity().address().clone(),
                vkey: poly.eval(node.index()).v,
                client,
            });
        }

        let handler = Self {
            public_key: dist.public_key().to_owned(),
            share,
            group,
            our_index,
            peers: Arc::new(peers),
            store,
            period,
            seed,
            next_round: catchup_round.unwrap_or(0),
            invalid_partials: Arc::new(AtomicU64::new(0)),
            l,
        };

        let (tx_cmd, rx_cmd) = mpsc::channel(1);
        let catchup = catchup_round.is_some();
        tracker.spawn(handler.run(rx_cmd, cancel, catchup));

        Ok(tx_cmd)
    }

    /// Main driver; returns only on `Stop` or cancellation.
    async fn run(
        mut self,
        mut rx_cmd: mpsc::Receiver<BeaconCmd>,
        cancel: CancellationToken,
        catchup: bool,
    ) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            parent: &self.l,
            "beacon_loop: started, index {}, first round {}", self.our_index, self.next_round
        );

        let mut round_task: Option<JoinHandle<()>> = None;
        let mut sync_task: Option<JoinHandle<()>> = None;

        // A node restarting with a non-empty store fetches whatever the
        // others finalized while it was down, before its first rounds.
        if catchup {
            self.maybe_resync(&mut sync_task, u64::MAX).await;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if let Err(err) = self.new_tick(&mut round_task, &mut sync_task).await {
                        error!(parent: &self.l, "beacon_loop: fatal: {err}");
                        break;
                    }
                }

                cmd = rx_cmd.recv() => match cmd {
                    Some(BeaconCmd::Process(req, cb)) => {
                        let result = self.process_beacon(&req).await;
                        // A request from the future is evidence that the
                        // chain is ahead of us.
                        if matches!(result, Err(BeaconError::NotReady { .. })) {
                            self.maybe_resync(&mut sync_task, req.round.saturating_sub(1)).await;
                        }
                        cb.reply(result);
                    }
                    Some(BeaconCmd::Stop(cb)) => {
                        cb.reply(Ok(()));
                        break;
                    }
                    None => break,
                }
            }
        }

        for task in [round_task, sync_task].into_iter().flatten() {
            task.abort();
        }
        info!(parent: &self.l, "beacon_loop: stopped");
    }

    /// Spawns a sync task toward `up_to` unless one is already in flight.
    async fn maybe_resync(&self, sync_task: &mut Option<JoinHandle<()>>, up_to: u64) {
        let syncing = sync_task.as_ref().is_some_and(|task| !task.is_finished());
        if syncing || self.peers.is_empty() {
            return;
        }

        let tip = match self.store.last().await {
            Ok(beacon) => Some(beacon),
            Err(StoreError::NoBeacon) => None,
            Err(err) => {
                error!(parent: &self.l, "resync: store unavailable: {err}");
                return;
            }
        };

        *sync_task = Some(super::sync::resync(
            tip,
            up_to,
            self.seed.clone(),
            self.public_key.to_owned(),
            Arc::clone(&self.peers),
            self.store.clone(),
            self.l.clone(),
        ));
    }

    /// One period tick: advance the round counter, lead the round if it is
    /// ours, trigger catch-up when the store is behind.
    async fn new_tick(
        &mut self,
        round_task: &mut Option<JoinHandle<()>>,
        sync_task: &mut Option<JoinHandle<()>>,
    ) -> Result<(), BeaconError> {
        let last = match self.store.last().await {
            Ok(beacon) => Some(beacon),
            Err(StoreError::NoBeacon) => None,
            // A failing store is fatal for the loop.
            Err(err) => return Err(err.into()),
        };

        let round = match &last {
            Some(beacon) => self.next_round.max(beacon.round + 1),
            None => self.next_round,
        };
        self.next_round = round + 1;

        let last_round = last.as_ref().map_or(0, |b| b.round);
        debug!(
            parent: &self.l,
            "beacon_loop: new_round {round}, latest stored {last_round}"
        );

        if self.group.leader(round).index() == self.our_index {
            if let Some(task) = round_task.take() {
                if !task.is_finished() {
                    warn!(parent: &self.l, "abandoning unfinished previous round task");
                    task.abort();
                }
            }
            match self.prepare_round(round, &last) {
                Ok(ctx) => *round_task = Some(tokio::spawn(ctx.run())),
                Err(err) => warn!(parent: &self.l, "round {round}: {err}"),
            }
        }

        // Resync if the chain tip is more than one round behind.
        if let Some(beacon) = &last {
            if round > beacon.round + 1 {
                self.maybe_resync(sync_task, round - 1).await;
            }
        }

        Ok(())
    }

    /// Assembles everything the round task needs, including our own partial,
    /// so the task holds no reference to the handler.
    fn prepare_round(
        &self,
        round: u64,
        last: &Option<Beacon>,
    ) -> Result<RoundContext<S>, BeaconError> {
        let previous_rand = match last {
            Some(beacon) => beacon.randomness.clone(),
            None => self.seed.clone(),
        };
        let msg = round_message(round, &previous_rand);
        let own_partial = tbls::sign(&self.share.pri_share, &msg)?;

        Ok(RoundContext {
            round,
            previous_rand,
            msg,
            own_partial: Some(own_partial),
            threshold: self.group.threshold as usize,
            public_key: self.public_key.to_owned(),
            peers: Arc::clone(&self.peers),
            store: self.store.clone(),
            deadline: self.period,
            invalid_partials: Arc::clone(&self.invalid_partials),
            l: self.l.clone(),
        })
    }

    /// Round currently in progress (or about to start).
    fn current_round(&self) -> u64 {
        self.next_round
    }

    /// Follower side of the round protocol.
    async fn process_beacon(&self, req: &BeaconRequest) -> Result<BeaconResponse, BeaconError> {
        // Idempotent replay: a recovering leader re-requesting a finalized
        // round gets the stored beacon instead of a fork.
        match self.store.last().await {
            Ok(last) if req.round <= last.round => {
                let stored = if last.round == req.round {
                    last
                } else {
                    match self.store.get(req.round).await {
                        Ok(beacon) => beacon,
                        // The round was skipped; the chain tip tells the
                        // caller the chain has moved past it.
                        Err(StoreError::NotFound) => last,
                        Err(err) => return Err(err.into()),
                    }
                };
                debug!(
                    parent: &self.l,
                    "process_beacon: replaying stored round {} for request {}",
                    stored.round, req.round
                );
                return Ok(BeaconResponse {
                    partial: vec![],
                    index: self.our_index,
                    beacon: Some(stored.into()),
                });
            }
            Ok(_) | Err(StoreError::NoBeacon) => {}
            Err(err) => return Err(err.into()),
        }

        // One round of clock drift is allowed; anything further ahead means
        // this node has not caught up yet and the leader must retry later.
        let current = self.current_round();
        if req.round > current + 1 {
            return Err(BeaconError::NotReady {
                round: req.round,
                current,
            });
        }

        let msg = round_message(req.round, &req.previous_rand);
        let sigshare = tbls::sign(&self.share.pri_share, &msg)?;
        let partial = sigshare.serialize()?;

        debug!(parent: &self.l, "process_beacon: signed partial for round {}", req.round);

        Ok(BeaconResponse {
            partial,
            index: self.our_index,
            beacon: None,
        })
    }
}

/// Everything one leader round needs; local to the round task, nothing is
/// shared across rounds.
struct RoundContext<S: Scheme> {
    round: u64,
    previous_rand: Vec<u8>,
    msg: Vec<u8>,
    own_partial: Option<SigShare<S>>,
    threshold: usize,
    public_key: KeyPoint<S>,
    peers: Arc<Vec<RoundPeer<S>>>,
    store: BeaconStore,
    deadline: Duration,
    invalid_partials: Arc<AtomicU64>,
    l: Span,
}

impl<S: Scheme> RoundContext<S> {
    /// Runs the round under its one-period budget. An exceeded budget
    /// abandons the round; the chain simply skips it.
    async fn run(mut self) {
        let round = self.round;
        let l = self.l.clone();
        match tokio::time::timeout(self.deadline, self.lead()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(parent: &l, "round {round} abandoned: {err}"),
            Err(_) => warn!(parent: &l, "round {round} abandoned: period deadline exceeded"),
        }
    }

    async fn lead(&mut self) -> Result<(), BeaconError> {
        debug!(
            parent: &self.l,
            "leading round {}, prev_rand {}", self.round,
            hex::encode(self.previous_rand.get(..3).unwrap_or_default())
        );

        let mut partials: Vec<SigShare<S>> = Vec::with_capacity(self.threshold);
        partials.push(self.own_partial.take().expect("own partial is set once"));
        if partials.len() >= self.threshold {
            return self.finalize(partials).await;
        }

        // Concurrent solicitation of the other n-1 nodes, each RPC bounded
        // by the round budget.
        let (tx, mut rx) = mpsc::channel::<(u32, BeaconResponse)>(self.peers.len().max(1));
        for peer in self.peers.iter() {
            let mut client = peer.client().clone();
            let request = BeaconRequest {
                round: self.round,
                previous_rand: self.previous_rand.clone(),
            };
            let deadline = self.deadline;
            let tx = tx.clone();
            let address = peer.address().clone();
            let index = peer.index;
            let l = self.l.clone();

            tokio::spawn(async move {
                match tokio::time::timeout(deadline, client.new_beacon(request)).await {
                    Ok(Ok(response)) => {
                        let _ = tx.send((index, response)).await;
                    }
                    Ok(Err(status)) => {
                        debug!(parent: &l, "new_beacon: {address}: {status}");
                    }
                    Err(_) => debug!(parent: &l, "new_beacon: {address}: deadline exceeded"),
                }
            });
        }
        drop(tx);

        while let Some((index, response)) = rx.recv().await {
            // A peer replayed an already finalized beacon for this round:
            // verify and adopt it instead of finishing the aggregation.
            if let Some(packet) = response.beacon {
                if packet.round == self.round {
                    let beacon = Beacon::from(packet);
                    if self.verify_adopted(&beacon) {
                        return self.store_finalized(beacon).await;
                    }
                    warn!(parent: &self.l, "discarding invalid replayed beacon from index {index}");
                }
                continue;
            }

            match self.verify_partial(index, &response.partial, &partials) {
                Ok(Some(sigshare)) => partials.push(sigshare),
                Ok(None) => {}
                Err(err) => {
                    self.invalid_partials.fetch_add(1, Ordering::Relaxed);
                    warn!(parent: &self.l, "round {}: index {index}: {err}", self.round);
                }
            }

            if partials.len() == self.threshold {
                return self.finalize(partials).await;
            }
        }

        Err(BeaconError::NotEnoughPartials {
            round: self.round,
            got: partials.len(),
            need: self.threshold,
        })
    }

    /// Checks one solicited partial; `Ok(None)` means duplicate.
    fn verify_partial(
        &self,
        index: u32,
        partial: &[u8],
        collected: &[SigShare<S>],
    ) -> Result<Option<SigShare<S>>, BeaconError> {
        let sigshare = SigShare::<S>::deserialize(partial).map_err(|_| BeaconError::InvalidPartial)?;
        if sigshare.index() != index {
            return Err(BeaconError::InvalidPartial);
        }
        if collected.iter().any(|s| s.index() == sigshare.index()) {
            return Ok(None);
        }

        let peer = self
            .peers
            .iter()
            .find(|p| p.index == sigshare.index())
            .ok_or(BeaconError::UnknownIndex(sigshare.index()))?;

        if S::bls_verify(&peer.vkey, sigshare.value(), &self.msg).is_err() {
            return Err(BeaconError::InvalidPartial);
        }

        Ok(Some(sigshare))
    }

    /// Lagrange reconstruction over `t` verified partials; the recovered
    /// signature must verify under the group key before persistence.
    async fn finalize(&self, mut partials: Vec<SigShare<S>>) -> Result<(), BeaconError> {
        partials.sort_by_key(SigShare::index);
        let recovered = tbls::recover_unchecked(&partials)?;

        if !super::is_valid_signature::<S>(
            &self.public_key,
            &self.previous_rand,
            self.round,
            &recovered,
        ) {
            error!(
                parent: &self.l,
                "round {}: recovered signature failed group verification", self.round
            );
            return Err(BeaconError::AggregateVerifyFailed);
        }

        let signature: Vec<u8> = Affine::serialize(&recovered)
            .map_err(|_| BeaconError::SerializeRecovered)?
            .into();

        self.store_finalized(Beacon::new(self.round, self.previous_rand.clone(), signature))
            .await
    }

    /// Replayed beacons are validated exactly like synced ones.
    fn verify_adopted(&self, beacon: &Beacon) -> bool {
        if beacon.previous_rand != self.previous_rand {
            return false;
        }
        if beacon.randomness != super::randomness_from_sig(&beacon.signature) {
            return false;
        }
        let Ok(signature) = Affine::deserialize(&beacon.signature) else {
            return false;
        };

        super::is_valid_signature::<S>(&self.public_key, &beacon.previous_rand, beacon.round, &signature)
    }

    async fn store_finalized(&self, beacon: Beacon) -> Result<(), BeaconError> {
        let round = beacon.round;
        let short_rand = hex::encode(beacon.randomness.get(..3).unwrap_or_default());

        match self.store.put(beacon).await {
            Ok(()) => {
                info!(
                    parent: &self.l,
                    "NEW_BEACON_STORED: round {round}, randomness {short_rand}.."
                );
                Ok(())
            }
            // A concurrent resync already stored this round.
            Err(StoreError::AlreadyExists) => {
                debug!(parent: &self.l, "round {round} already stored");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::beacon::{randomness_from_sig, verify_chained, DEFAULT_SEED};
    use crate::key::keys::Pair;
    use crate::net::utils::Address;
    use energon::drand::schemes::DefaultScheme;
    use energon::cyber::poly::PriShare;
    use energon::traits::ScalarField;

    type TestScheme = DefaultScheme;

    /// Single-node group, t = 1: the share is the group secret itself and
    /// the commitment list is the bare public key.
    fn solo_setup() -> (DistKeyShare<TestScheme>, Group<TestScheme>, DistPublic<TestScheme>) {
        let sk = <TestScheme as Scheme>::Scalar::random();
        let pk = TestScheme::sk_to_pk(&sk);

        let share = DistKeyShare {
            commits: vec![pk.clone()],
            pri_share: PriShare { i: 0, v: sk },
        };
        let dist = DistPublic::new(vec![pk]);

        let address = Address::precheck("127.0.0.1:7400").unwrap();
        let identity = Pair::<TestScheme>::generate(address, false)
            .public_identity()
            .clone();
        let group = Group::from_identities(vec![identity], 1).unwrap();

        (share, group, dist)
    }

    async fn solo_handler(store: BeaconStore) -> BeaconHandler<TestScheme> {
        let (share, group, dist) = solo_setup();
        let public_key = dist.public_key().to_owned();

        BeaconHandler {
            share,
            group,
            public_key,
            our_index: 0,
            peers: Arc::new(vec![]),
            store,
            period: Duration::from_secs(1),
            seed: DEFAULT_SEED.to_vec(),
            next_round: 0,
            invalid_partials: Arc::new(AtomicU64::new(0)),
            l: Span::none(),
        }
    }

    async fn temp_store(dir: &tempfile::TempDir) -> BeaconStore {
        BeaconStore::start(dir.path(), vec![], Span::none())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn solo_round_finalizes_and_chains() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = solo_handler(temp_store(&dir).await).await;

        // t = 1 boundary: the leader's own partial is enough for round 0.
        let ctx = handler.prepare_round(0, &None).unwrap();
        ctx.run().await;

        let beacon0 = handler.store.last().await.unwrap();
        assert_eq!(beacon0.round, 0);
        assert_eq!(beacon0.previous_rand, DEFAULT_SEED.to_vec());
        assert_eq!(beacon0.randomness, randomness_from_sig(&beacon0.signature));

        // Round 1 chains to round 0 and verifies under the group key.
        let ctx = handler.prepare_round(1, &Some(beacon0.clone())).unwrap();
        ctx.run().await;

        let beacon1 = handler.store.get(1).await.unwrap();
        assert_eq!(beacon1.previous_rand, beacon0.randomness);
        assert!(verify_chained::<TestScheme>(
            &handler.public_key,
            &beacon0,
            &beacon1
        ));
    }

    #[tokio::test]
    async fn process_beacon_signs_deterministically() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = solo_handler(temp_store(&dir).await).await;

        let req = BeaconRequest {
            round: 0,
            previous_rand: DEFAULT_SEED.to_vec(),
        };
        let a = handler.process_beacon(&req).await.unwrap();
        let b = handler.process_beacon(&req).await.unwrap();

        // BLS is deterministic: replaying the same request returns the same
        // partial bytes.
        assert!(!a.partial.is_empty());
        assert_eq!(a.partial, b.partial);
        assert_eq!(a.index, 0);
        assert!(a.beacon.is_none());
    }

    #[tokio::test]
    async fn process_beacon_gates_far_future_rounds() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = solo_handler(temp_store(&dir).await).await;

        let req = BeaconRequest {
            round: 5,
            previous_rand: DEFAULT_SEED.to_vec(),
        };
        match handler.process_beacon(&req).await {
            Err(BeaconError::NotReady { round: 5, .. }) => {}
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn process_beacon_replays_finalized_rounds() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = solo_handler(temp_store(&dir).await).await;

        let ctx = handler.prepare_round(0, &None).unwrap();
        ctx.run().await;
        let stored = handler.store.get(0).await.unwrap();

        let req = BeaconRequest {
            round: 0,
            previous_rand: DEFAULT_SEED.to_vec(),
        };
        let response = handler.process_beacon(&req).await.unwrap();

        assert!(response.partial.is_empty());
        let replayed = Beacon::from(response.beacon.unwrap());
        assert_eq!(replayed, stored);
    }

    #[tokio::test]
    async fn byzantine_partial_is_discarded() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = solo_handler(temp_store(&dir).await).await;
        let ctx = handler.prepare_round(0, &None).unwrap();

        // A random 48-byte blob is not a parsable sigshare.
        let garbage = vec![0xAB; 48];
        assert!(matches!(
            ctx.verify_partial(3, &garbage, &[]),
            Err(BeaconError::InvalidPartial) | Err(BeaconError::UnknownIndex(_))
        ));
    }
}
