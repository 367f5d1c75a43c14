//! Catch-up logic: a node whose store lags the round counter fetches missing
//! beacons from peers over the `SyncChain` stream and verifies every one of
//! them against the distributed public key before storing.

use super::handler::RoundPeer;
use super::store::{BeaconStore, StoreError};
use super::{is_valid_signature, randomness_from_sig, Beacon};
use crate::key::{KeyPoint, Scheme};

use energon::traits::Affine;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Span};

/// Walks peers in random order, streaming beacons above the stored tip until
/// `up_to` is reached or every peer has been tried. Pass `u64::MAX` to sync
/// as far as any peer can serve. Each streamed beacon must chain onto the
/// local tip (the genesis seed for an empty store) and carry a valid
/// aggregate signature.
pub fn resync<S: Scheme>(
    tip: Option<Beacon>,
    up_to: u64,
    seed: Vec<u8>,
    public_key: KeyPoint<S>,
    peers: Arc<Vec<RoundPeer<S>>>,
    store: BeaconStore,
    log: Span,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut order: Vec<usize> = (0..peers.len()).collect();
        order.shuffle(&mut rand::rng());

        let mut last = tip;
        debug!(
            parent: &log,
            "resync: starting, latest stored {:?}, target {up_to}",
            last.as_ref().map(|b| b.round)
        );

        'peers: for peer_pos in order {
            let peer = &peers[peer_pos];
            let from_round = match &last {
                Some(beacon) if beacon.round >= up_to => break,
                Some(beacon) => beacon.round + 1,
                None => 0,
            };

            let mut client = peer.client().clone();
            let mut stream = match client.sync_chain(from_round).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(parent: &log, "resync: skipping {}: {err}", peer.address());
                    continue;
                }
            };

            while let Ok(Some(packet)) = stream.message().await {
                let candidate = Beacon::from(packet);
                if !verify_next(&public_key, last.as_ref(), &seed, &candidate) {
                    warn!(
                        parent: &log,
                        "resync: skipping {}: invalid beacon for round {}",
                        peer.address(),
                        candidate.round
                    );
                    continue 'peers;
                }

                let round = candidate.round;
                match store.put(candidate.clone()).await {
                    Ok(()) => debug!(parent: &log, "resync: stored round {round}"),
                    // Lost a race against a concurrently finalized round.
                    Err(StoreError::AlreadyExists) => {}
                    Err(err) => {
                        error!(parent: &log, "resync: store failure at round {round}: {err}");
                        return;
                    }
                }
                last = Some(candidate);

                if round >= up_to {
                    debug!(parent: &log, "resync: reached target {up_to}");
                    return;
                }
            }
        }

        debug!(
            parent: &log,
            "resync: finished, latest stored {:?}",
            last.as_ref().map(|b| b.round)
        );
    })
}

/// A synced beacon is acceptable iff its round moves the chain forward, its
/// previous randomness equals the tip's randomness (the seed for an empty
/// store), its randomness is the digest of its signature and the signature
/// verifies under the group key.
pub(super) fn verify_next<S: Scheme>(
    public_key: &KeyPoint<S>,
    last: Option<&Beacon>,
    seed: &[u8],
    candidate: &Beacon,
) -> bool {
    let expected_prev = last.map_or(seed, |beacon| &beacon.randomness);
    // Rounds may be sparse, but never move backwards.
    if let Some(beacon) = last {
        if candidate.round <= beacon.round {
            return false;
        }
    }
    if candidate.previous_rand != expected_prev {
        return false;
    }
    if candidate.randomness != randomness_from_sig(&candidate.signature) {
        return false;
    }
    let Ok(signature) = Affine::deserialize(&candidate.signature) else {
        return false;
    };

    is_valid_signature::<S>(
        public_key,
        &candidate.previous_rand,
        candidate.round,
        &signature,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::beacon::{round_message, DEFAULT_SEED};
    use crate::key::Scheme;
    use energon::drand::schemes::DefaultScheme;
    use energon::traits::ScalarField;

    fn signed_beacon(
        sk: &<DefaultScheme as Scheme>::Scalar,
        round: u64,
        previous_rand: &[u8],
    ) -> Beacon {
        let sig = DefaultScheme::bls_sign(&round_message(round, previous_rand), sk).unwrap();
        let sig_bytes: Vec<u8> = sig.serialize().unwrap().into();

        Beacon::new(round, previous_rand.to_vec(), sig_bytes)
    }

    #[test]
    fn synced_beacons_are_validated_against_the_tip() {
        let sk = <DefaultScheme as Scheme>::Scalar::random();
        let pk = DefaultScheme::sk_to_pk(&sk);

        // Empty store: round 0 must chain onto the genesis seed.
        let beacon0 = signed_beacon(&sk, 0, DEFAULT_SEED);
        assert!(verify_next::<DefaultScheme>(&pk, None, DEFAULT_SEED, &beacon0));

        // Skipped rounds are fine as long as linkage holds.
        let beacon5 = signed_beacon(&sk, 5, &beacon0.randomness);
        assert!(verify_next::<DefaultScheme>(
            &pk,
            Some(&beacon0),
            DEFAULT_SEED,
            &beacon5
        ));

        // The chain never moves backwards.
        assert!(!verify_next::<DefaultScheme>(
            &pk,
            Some(&beacon5),
            DEFAULT_SEED,
            &beacon0
        ));

        // Broken linkage is rejected even with a valid signature.
        let unlinked = signed_beacon(&sk, 6, b"not the tip randomness");
        assert!(!verify_next::<DefaultScheme>(
            &pk,
            Some(&beacon5),
            DEFAULT_SEED,
            &unlinked
        ));
    }
}
