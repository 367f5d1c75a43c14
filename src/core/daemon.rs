//! The node facade: binds keys, group, DKG driver, beacon handler and store
//! to the transport surface, and gates operations on the DKG phase.
//!
//! The phase transition `Uninitialized -> Serving` happens through a single
//! atomic store ([`ArcSwapOption`]); request handlers snapshot the pointer
//! and never hold a lock across crypto work.

use super::config::{Config, ConfigError};
use crate::beacon::handler::{BeaconCmd, BeaconError, BeaconHandler};
use crate::beacon::store::{BeaconStore, StoreError};
use crate::beacon::Beacon;
use crate::dkg::{DkgDriver, DkgError, DkgGateway, DkgResult};
use crate::ecies::{self, EciesError, EciesKeypair};
use crate::key::group::Group;
use crate::key::keys::{Identity, Pair};
use crate::key::store::FileStore;
use crate::key::Scheme;
use crate::net::protocol::ProtocolClient;
use crate::net::utils::{Callback, ClientTls};
use crate::protobuf::quorand::{BeaconRequest, BeaconResponse, DkgPacket, PublicRandResponse};

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, Span};

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("dkg not finished")]
    DkgNotFinished,
    #[error("dkg finished already")]
    DkgFinished,
    #[error("dkg: {0}")]
    Dkg(#[from] DkgError),
    #[error("beacon: {0}")]
    Beacon(#[from] BeaconError),
    #[error("internal error")]
    Internal,
}

/// State available only after a completed DKG.
struct Serving {
    store: BeaconStore,
    beacon_tx: mpsc::Sender<BeaconCmd>,
}

enum DkgPhase<S: Scheme> {
    /// No DKG traffic seen yet; a follower leaves this state on the first
    /// inbound packet, the leader through [`Daemon::start_dkg`].
    Idle,
    Running(DkgDriver<S>),
    Done,
}

pub struct Daemon<S: Scheme> {
    keypair: Pair<S>,
    ecies: EciesKeypair,
    group: Group<S>,
    config: Config,
    fs: FileStore,
    serving: ArcSwapOption<Serving>,
    dkg: Mutex<DkgPhase<S>>,
    pub tracker: TaskTracker,
    pub token: CancellationToken,
    l: Span,
}

impl<S: Scheme> Daemon<S> {
    pub fn new(
        keypair: Pair<S>,
        group: Group<S>,
        config: Config,
        fs: FileStore,
    ) -> anyhow::Result<Arc<Self>> {
        let l = info_span!("", node = %keypair.public_identity().address());
        let ecies = keypair.ecies_keypair()?;

        Ok(Arc::new(Self {
            keypair,
            ecies,
            group,
            config,
            fs,
            serving: ArcSwapOption::from(None),
            dkg: Mutex::new(DkgPhase::Idle),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            l,
        }))
    }

    pub fn log(&self) -> &Span {
        &self.l
    }

    pub fn identity(&self) -> &Identity<S> {
        self.keypair.public_identity()
    }

    /// Server TLS identity PEMs, `None` when running insecure.
    pub fn server_tls(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, ConfigError> {
        self.config.server_tls_pem()
    }

    /// Restores a node as it was running after a completed DKG: distributed
    /// material comes from disk and the beacon loop starts immediately.
    pub async fn load(self: &Arc<Self>) -> anyhow::Result<()> {
        let share = self.fs.load_share::<S>()?;
        let dist_public = self.fs.load_dist_public::<S>()?;
        let group = self.fs.load_group::<S>()?;

        *self.dkg.lock().await = DkgPhase::Done;
        self.init_beacon(DkgResult {
            share,
            dist_public,
            qualified: group,
        })
        .await?;
        info!(parent: &self.l, "loaded and serving at {}", self.identity().address());

        Ok(())
    }

    /// Leader entry point: initiates the DKG by running the sub-protocol,
    /// whose first broadcast packet reaches every follower.
    pub async fn start_dkg(self: &Arc<Self>) -> Result<(), DaemonError> {
        let mut phase = self.dkg.lock().await;
        self.start_driver(&mut phase)?;

        Ok(())
    }

    /// Server-side `Setup`: valid only while the DKG is running. The first
    /// packet moves a follower from `Idle` to `Running`.
    pub async fn setup(self: &Arc<Self>, packet: DkgPacket) -> Result<(), DaemonError> {
        let mut phase = self.dkg.lock().await;
        if matches!(&*phase, DkgPhase::Idle) {
            self.start_driver(&mut phase)?;
        }

        match &*phase {
            DkgPhase::Running(driver) => Ok(driver.process(packet).await?),
            DkgPhase::Done => Err(DaemonError::DkgFinished),
            DkgPhase::Idle => unreachable!("driver started above"),
        }
    }

    /// Spawns driver and outcome watcher; caller holds the phase lock.
    fn start_driver(self: &Arc<Self>, phase: &mut DkgPhase<S>) -> Result<(), DaemonError> {
        match phase {
            DkgPhase::Running(_) => Ok(()),
            DkgPhase::Done => Err(DaemonError::DkgFinished),
            DkgPhase::Idle => {
                let our_index = self
                    .group
                    .find_index(self.identity())
                    .ok_or(DkgError::NotInGroup)?;

                let gateway = Arc::new(DkgNetwork {
                    tls: self.config.client_tls(),
                });
                let (driver, outcome_rx) = DkgDriver::start(
                    self.keypair.private_key(),
                    &self.group,
                    our_index,
                    self.config.dkg_timeout.as_duration(),
                    gateway,
                    &self.tracker,
                    &self.l,
                )?;
                *phase = DkgPhase::Running(driver);

                let daemon = Arc::clone(self);
                self.tracker.spawn(async move { daemon.wait_dkg(outcome_rx).await });

                Ok(())
            }
        }
    }

    /// Waits for the one-shot DKG outcome. On success the output is
    /// persisted (share first, then distributed key, then group) and the
    /// beacon loop starts; fatal errors stop the node.
    async fn wait_dkg(self: Arc<Self>, outcome_rx: oneshot::Receiver<Result<DkgResult<S>, DkgError>>) {
        let outcome = match outcome_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DkgError::DriverClosed),
        };

        match outcome {
            Ok(result) => {
                let stored = self
                    .fs
                    .save_share(&result.share)
                    .and_then(|_| self.fs.save_dist_public(&result.dist_public))
                    .and_then(|_| self.fs.save_group(&result.qualified));
                if let Err(err) = stored {
                    error!(parent: &self.l, "fatal: failed to persist dkg output: {err}");
                    self.token.cancel();
                    return;
                }
                info!(
                    parent: &self.l,
                    "dkg output persisted, share at {}",
                    self.fs.private_share_file().display()
                );

                *self.dkg.lock().await = DkgPhase::Done;
                if let Err(err) = self.init_beacon(result).await {
                    error!(parent: &self.l, "fatal: failed to start beacon loop: {err}");
                    self.token.cancel();
                }
            }
            Err(err) => {
                // DKGTimeout / DKGFailure are fatal; the node exits.
                error!(parent: &self.l, "fatal: {err}");
                self.token.cancel();
            }
        }
    }

    /// Opens the beacon store and starts the round loop; flips the node into
    /// the serving phase. Catch-up mode iff the store already has beacons.
    async fn init_beacon(self: &Arc<Self>, result: DkgResult<S>) -> anyhow::Result<()> {
        let store = BeaconStore::start(
            &self.fs.db_path(),
            self.config.take_callbacks(),
            self.l.clone(),
        )
        .await?;

        let catchup_round = match store.last().await {
            Ok(beacon) => {
                info!(
                    parent: &self.l,
                    "starting beacon loop in catch-up mode, latest stored {}", beacon.round
                );
                Some(beacon.round + 1)
            }
            Err(StoreError::NoBeacon) => {
                info!(parent: &self.l, "starting beacon loop");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let beacon_tx = BeaconHandler::start(
            result.share,
            result.qualified,
            &result.dist_public,
            store.clone(),
            self.config.period.as_duration(),
            self.config.seed.clone(),
            catchup_round,
            Some(self.config.client_tls()),
            &self.tracker,
            self.token.child_token(),
            self.l.clone(),
        )?;

        self.serving
            .store(Some(Arc::new(Serving { store, beacon_tx })));

        Ok(())
    }

    /// Server-side `NewBeacon`: valid only after the DKG is done.
    pub async fn new_beacon(&self, request: BeaconRequest) -> Result<BeaconResponse, DaemonError> {
        let Some(serving) = self.serving.load_full() else {
            return Err(DaemonError::DkgNotFinished);
        };

        let (cb, rx) = Callback::<BeaconResponse, BeaconError>::new();
        serving
            .beacon_tx
            .send(BeaconCmd::Process(request, cb))
            .await
            .map_err(|_| DaemonError::Internal)?;

        rx.await
            .map_err(|_| DaemonError::Internal)?
            .map_err(DaemonError::Beacon)
    }

    /// Latest finalized beacon, or `NoBeacon` while the store is empty.
    pub async fn public(&self) -> Result<PublicRandResponse, StoreError> {
        let Some(serving) = self.serving.load_full() else {
            return Err(StoreError::NoBeacon);
        };
        let beacon = serving.store.last().await?;

        Ok(PublicRandResponse {
            round: beacon.round,
            previous: beacon.previous_rand,
            randomness: beacon.randomness,
        })
    }

    /// Stateless private randomness exchange, independent of the beacon.
    pub fn private(&self, request: &[u8]) -> Result<Vec<u8>, EciesError> {
        ecies::answer_request(&self.ecies, request)
    }

    /// Store cursor backing the `SyncChain` stream.
    pub async fn sync(
        &self,
        from_round: u64,
    ) -> Result<mpsc::Receiver<Result<Beacon, StoreError>>, DaemonError> {
        let Some(serving) = self.serving.load_full() else {
            return Err(DaemonError::DkgNotFinished);
        };

        serving
            .store
            .cursor(from_round)
            .await
            .map_err(|_| DaemonError::Internal)
    }

    /// Idempotent shutdown: stops the transport gateway, then the beacon
    /// handler. In-flight inbound handlers are permitted to complete.
    pub async fn stop(&self) {
        self.token.cancel();

        if let Some(serving) = self.serving.load_full() {
            let (cb, rx) = Callback::new();
            if serving.beacon_tx.send(BeaconCmd::Stop(cb)).await.is_ok() {
                let _ = rx.await;
            }
        }
        self.tracker.close();
        info!(parent: &self.l, "daemon stopped");
    }
}

/// Outbound path of the DKG sub-protocol; the sub-protocol itself has no
/// vision of daemon internals or the transport.
struct DkgNetwork {
    tls: ClientTls,
}

#[tonic::async_trait]
impl<S: Scheme> DkgGateway<S> for DkgNetwork {
    async fn send(&self, peer: &Identity<S>, packet: DkgPacket) -> anyhow::Result<()> {
        let tls = peer.tls().then_some(&self.tls);
        let mut client = ProtocolClient::connect(peer.address(), tls).await?;
        client.setup(packet).await?;

        Ok(())
    }
}
