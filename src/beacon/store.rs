//! This module implements an actor pattern for the beacon store using
//! [rocksdb] under the hood: a dedicated blocking thread owns the single DB
//! handle for the node's lifetime, commands arrive over a channel and are
//! answered through one-shot callbacks. Keys are big-endian round numbers,
//! so iteration order is round order.

use super::Beacon;
use crate::net::utils::Callback;
use crate::protobuf::quorand::BeaconPacket;

use prost::Message;
use rocksdb::{Direction, IteratorMode, Options, WriteOptions, DB};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{error, warn, Span};

/// Number of beacons read per batch while feeding a cursor.
const BATCH_SIZE: usize = 128;

/// Hook invoked synchronously after every successful `put`, with the freshly
/// stored beacon. Hook failures never roll back the write.
pub type PutCallback = Box<dyn Fn(&Beacon) + Send>;

/// Error details are traced within the store actor (see [`BeaconStore::start`]).
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("internal storage error")]
    Internal,
    #[error("no beacon saved yet")]
    NoBeacon,
    #[error("beacon not found")]
    NotFound,
    #[error("beacon for this round is already stored")]
    AlreadyExists,
    #[error("actor receiver has been closed unexpectedly")]
    ActorClosedRx,
    #[error("cb sender has been closed unexpectedly")]
    CbClosedTx(#[from] tokio::sync::oneshot::error::RecvError),
}

enum Cmd {
    Put {
        beacon: Beacon,
        cb: Callback<(), StoreError>,
    },
    Last {
        cb: Callback<Beacon, StoreError>,
    },
    Get {
        round: u64,
        cb: Callback<Beacon, StoreError>,
    },
    Cursor {
        from_round: u64,
        cb: Callback<mpsc::Receiver<Result<Beacon, StoreError>>, StoreError>,
    },
}

/// Handle for the beacon store actor.
#[derive(Clone)]
pub struct BeaconStore {
    sender: mpsc::Sender<Cmd>,
}

impl BeaconStore {
    /// Opens the database and starts the actor. `callbacks` are registered
    /// once, here, and fire after each successful put.
    pub async fn start(
        path: &Path,
        callbacks: Vec<PutCallback>,
        log: Span,
    ) -> Result<Self, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Cmd>(1);
        let path = path.to_path_buf();

        task::spawn_blocking(move || {
            let db = match open_db(&path) {
                Ok(db) => {
                    cb_tx.reply(Ok(()));
                    Arc::new(db)
                }
                Err(err) => {
                    error!(parent: &log, "failed to open beacon db: {err}");
                    cb_tx.reply(Err(StoreError::Internal));
                    return;
                }
            };

            while let Some(cmd) = cmd_rx.blocking_recv() {
                match cmd {
                    Cmd::Put { beacon, cb } => match put(&db, &beacon) {
                        Ok(()) => {
                            for hook in &callbacks {
                                hook(&beacon);
                            }
                            cb.reply(Ok(()));
                        }
                        Err(err @ StoreError::AlreadyExists) => {
                            warn!(parent: &log, "duplicate put for round {}", beacon.round);
                            cb.reply(Err(err));
                        }
                        Err(err) => {
                            error!(parent: &log, "failed to put beacon: {err}");
                            cb.reply(Err(StoreError::Internal));
                            return;
                        }
                    },
                    Cmd::Last { cb } => cb.reply(last(&db, &log)),
                    Cmd::Get { round, cb } => cb.reply(get(&db, round, &log)),
                    Cmd::Cursor { from_round, cb } => {
                        cb.reply(Ok(cursor(&db, from_round, log.clone())));
                    }
                }
            }
        });

        cb_rx.await??;

        Ok(Self { sender: cmd_tx })
    }

    /// Persists a beacon; durable once this returns. Duplicate rounds are
    /// rejected with [`StoreError::AlreadyExists`].
    pub async fn put(&self, beacon: Beacon) -> Result<(), StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Put { beacon, cb: cb_tx })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }

    pub async fn get(&self, round: u64) -> Result<Beacon, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Get { round, cb: cb_tx })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }

    pub async fn last(&self) -> Result<Beacon, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Last { cb: cb_tx })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }

    /// Lazy finite forward iterator over stored beacons, in round order.
    pub async fn cursor(
        &self,
        from_round: u64,
    ) -> Result<mpsc::Receiver<Result<Beacon, StoreError>>, StoreError> {
        let (cb_tx, cb_rx) = Callback::new();
        self.sender
            .send(Cmd::Cursor {
                from_round,
                cb: cb_tx,
            })
            .await
            .map_err(|_| StoreError::ActorClosedRx)?;

        cb_rx.await?
    }
}

fn open_db(path: &Path) -> Result<DB, rocksdb::Error> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.set_compression_type(rocksdb::DBCompressionType::Lz4);

    DB::open(&options, path)
}

fn decode(round: u64, value: &[u8], log: &Span) -> Result<Beacon, StoreError> {
    match BeaconPacket::decode(value) {
        Ok(packet) => Ok(Beacon {
            round,
            previous_rand: packet.previous_rand,
            randomness: packet.randomness,
            signature: packet.signature,
        }),
        Err(err) => {
            error!(parent: log, "torn or corrupt record for round {round}: {err}");
            Err(StoreError::Internal)
        }
    }
}

fn put(db: &DB, beacon: &Beacon) -> Result<(), StoreError> {
    let key = beacon.round.to_be_bytes();
    if db.get(key).map_err(|_| StoreError::Internal)?.is_some() {
        return Err(StoreError::AlreadyExists);
    }

    let value = BeaconPacket {
        round: beacon.round,
        previous_rand: beacon.previous_rand.clone(),
        randomness: beacon.randomness.clone(),
        signature: beacon.signature.clone(),
    }
    .encode_to_vec();

    // Synchronous write: the beacon must be durable before the round is
    // considered finalized.
    let mut write_options = WriteOptions::default();
    write_options.set_sync(true);
    db.put_opt(key, value, &write_options)
        .map_err(|_| StoreError::Internal)
}

fn last(db: &DB, log: &Span) -> Result<Beacon, StoreError> {
    let mut iter = db.iterator(IteratorMode::End);
    match iter.next() {
        Some(Ok((key, value))) => {
            let round = round_from_key(&key)?;
            decode(round, &value, log)
        }
        Some(Err(_)) => Err(StoreError::Internal),
        None => Err(StoreError::NoBeacon),
    }
}

fn get(db: &DB, round: u64, log: &Span) -> Result<Beacon, StoreError> {
    match db.get(round.to_be_bytes()) {
        Ok(Some(value)) => decode(round, &value, log),
        Ok(None) => Err(StoreError::NotFound),
        Err(_) => Err(StoreError::Internal),
    }
}

fn round_from_key(key: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| StoreError::Internal)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Streams beacons `from_round..` into a bounded channel, reading in batches
/// so no iterator outlives a slow receiver. Backpressure comes from the
/// channel capacity.
fn cursor(db: &Arc<DB>, from_round: u64, log: Span) -> mpsc::Receiver<Result<Beacon, StoreError>> {
    let (tx, rx) = mpsc::channel(BATCH_SIZE);
    let db = Arc::clone(db);

    task::spawn_blocking(move || {
        let mut from = from_round;
        loop {
            let start = from.to_be_bytes();
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            for item in db
                .iterator(IteratorMode::From(&start, Direction::Forward))
                .take(BATCH_SIZE)
            {
                match item {
                    Ok((key, value)) => {
                        let beacon =
                            round_from_key(&key).and_then(|round| decode(round, &value, &log));
                        if let Ok(beacon) = &beacon {
                            // Rounds are not necessarily contiguous.
                            from = beacon.round + 1;
                        }
                        batch.push(beacon);
                    }
                    Err(err) => {
                        error!(parent: &log, "cursor iteration: {err}");
                        batch.push(Err(StoreError::Internal));
                    }
                }
                if batch.last().is_some_and(Result::is_err) {
                    break;
                }
            }

            let received = batch.len();
            for beacon in batch {
                let stop = beacon.is_err();
                if tx.blocking_send(beacon).is_err() || stop {
                    return;
                }
            }
            if received < BATCH_SIZE {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn test_beacon(round: u64) -> Beacon {
        Beacon::new(round, round.to_be_bytes().to_vec(), vec![round as u8; 48])
    }

    async fn fresh_store(path: &Path, callbacks: Vec<PutCallback>) -> BeaconStore {
        BeaconStore::start(path, callbacks, Span::none())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_last_cursor() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = fresh_store(dir.path(), vec![]).await;

        assert!(matches!(store.last().await, Err(StoreError::NoBeacon)));
        assert!(matches!(store.get(0).await, Err(StoreError::NotFound)));

        let total = 64u64;
        for round in 0..total {
            store.put(test_beacon(round)).await.unwrap();
        }

        assert_eq!(store.last().await.unwrap().round, total - 1);
        for round in 0..total {
            assert_eq!(store.get(round).await.unwrap(), test_beacon(round));
        }

        let mut rx = store.cursor(10).await.unwrap();
        for round in 10..total {
            assert_eq!(rx.recv().await.unwrap().unwrap().round, round);
        }
        // Finite: the stream ends after the last stored beacon.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_rounds_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = fresh_store(dir.path(), vec![]).await;

        store.put(test_beacon(5)).await.unwrap();
        assert!(matches!(
            store.put(test_beacon(5)).await,
            Err(StoreError::AlreadyExists)
        ));
        // The original record is untouched.
        assert_eq!(store.get(5).await.unwrap(), test_beacon(5));
    }

    #[tokio::test]
    async fn callbacks_fire_after_put() {
        let dir = tempfile::TempDir::new().unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);

        let store = fresh_store(
            dir.path(),
            vec![Box::new(move |b: &Beacon| {
                seen_cb.store(b.round + 1, Ordering::SeqCst);
            })],
        )
        .await;

        store.put(test_beacon(41)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);

        // Rejected duplicates do not fire hooks.
        let _ = store.put(test_beacon(41)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn reopen_preserves_acknowledged_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = fresh_store(dir.path(), vec![]).await;
            for round in 0..8 {
                store.put(test_beacon(round)).await.unwrap();
            }
        }
        // Dropping the handle stops the actor and closes the db.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;

        let store = fresh_store(dir.path(), vec![]).await;
        assert_eq!(store.last().await.unwrap().round, 7);
    }
}
