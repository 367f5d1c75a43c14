pub mod handler;
pub mod store;
pub mod sync;

use crate::key::{KeyPoint, Scheme, SigPoint};
use crate::protobuf::quorand::BeaconPacket;

use energon::traits::Affine;
use sha2::{Digest, Sha512};

/// Genesis `previous_randomness` of round 0. Compatible nodes must use
/// byte-identical seeds.
pub const DEFAULT_SEED: &[u8] =
    b"Truth is like the sun. You can shut it out for a time, but it ain't goin' away.";

/// One finalized round of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub round: u64,
    /// Randomness of the previous finalized round, the genesis seed for
    /// round 0.
    pub previous_rand: Vec<u8>,
    /// `randomness_from_sig(signature)`, the public output of the round.
    pub randomness: Vec<u8>,
    /// Aggregate BLS signature over `round_message(round, previous_rand)`.
    pub signature: Vec<u8>,
}

impl Beacon {
    pub fn new(round: u64, previous_rand: Vec<u8>, signature: Vec<u8>) -> Self {
        let randomness = randomness_from_sig(&signature);
        Self {
            round,
            previous_rand,
            randomness,
            signature,
        }
    }
}

impl From<BeaconPacket> for Beacon {
    fn from(p: BeaconPacket) -> Self {
        Self {
            round: p.round,
            previous_rand: p.previous_rand,
            randomness: p.randomness,
            signature: p.signature,
        }
    }
}

impl From<Beacon> for BeaconPacket {
    fn from(b: Beacon) -> Self {
        Self {
            round: b.round,
            previous_rand: b.previous_rand,
            randomness: b.randomness,
            signature: b.signature,
        }
    }
}

/// The exact byte string fed to the BLS hash-to-point:
/// `BE_u64(round) || previous_randomness`. Agreement on this encoding across
/// peers is a protocol invariant.
pub fn round_message(round: u64, previous_rand: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(8 + previous_rand.len());
    msg.extend_from_slice(&round.to_be_bytes());
    msg.extend_from_slice(previous_rand);

    msg
}

/// Protocol constant `H`: SHA-512 of the canonical signature encoding,
/// truncated to 32 bytes.
pub fn randomness_from_sig(signature: &[u8]) -> Vec<u8> {
    let digest = Sha512::digest(signature);
    digest[..32].to_vec()
}

/// BLS check of an aggregated or synced signature against the group key.
pub fn is_valid_signature<S: Scheme>(
    public_key: &KeyPoint<S>,
    previous_rand: &[u8],
    round: u64,
    signature: &SigPoint<S>,
) -> bool {
    let msg = round_message(round, previous_rand);
    S::bls_verify(public_key, signature, &msg).is_ok()
}

/// Full validation of a beacon received from a peer: chain linkage to the
/// local tip, aggregate signature, randomness digest.
pub fn verify_chained<S: Scheme>(
    public_key: &KeyPoint<S>,
    previous: &Beacon,
    candidate: &Beacon,
) -> bool {
    if candidate.previous_rand != previous.randomness {
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
    use energon::drand::schemes::DefaultScheme;
    use energon::traits::ScalarField;

    #[test]
    fn round_message_framing() {
        let msg = round_message(7, b"prev");
        assert_eq!(&msg[..8], &7u64.to_be_bytes());
        assert_eq!(&msg[8..], b"prev");

        // Round 0 is fed the genesis seed, no store lookup involved.
        let genesis = round_message(0, DEFAULT_SEED);
        assert_eq!(genesis.len(), 8 + DEFAULT_SEED.len());
    }

    #[test]
    fn randomness_is_a_32_byte_digest() {
        let randomness = randomness_from_sig(b"some signature bytes");
        assert_eq!(randomness.len(), 32);
        assert_eq!(randomness, randomness_from_sig(b"some signature bytes"));
        assert_ne!(randomness, randomness_from_sig(b"other signature bytes"));
    }

    #[test]
    fn signature_verifies_against_its_key() {
        let sk = <DefaultScheme as Scheme>::Scalar::random();
        let pk = DefaultScheme::sk_to_pk(&sk);

        let msg = round_message(1, DEFAULT_SEED);
        let sig = DefaultScheme::bls_sign(&msg, &sk).unwrap();

        assert!(is_valid_signature::<DefaultScheme>(&pk, DEFAULT_SEED, 1, &sig));
        // Wrong round, wrong prev: both must fail.
        assert!(!is_valid_signature::<DefaultScheme>(&pk, DEFAULT_SEED, 2, &sig));
        assert!(!is_valid_signature::<DefaultScheme>(&pk, b"forged", 1, &sig));
    }

    #[test]
    fn chained_verification_checks_every_link() {
        let sk = <DefaultScheme as Scheme>::Scalar::random();
        let pk = DefaultScheme::sk_to_pk(&sk);

        let sig0 = DefaultScheme::bls_sign(&round_message(0, DEFAULT_SEED), &sk).unwrap();
        let sig0_bytes: Vec<u8> = sig0.serialize().unwrap().into();
        let beacon0 = Beacon::new(0, DEFAULT_SEED.to_vec(), sig0_bytes);

        let sig1 =
            DefaultScheme::bls_sign(&round_message(1, &beacon0.randomness), &sk).unwrap();
        let sig1_bytes: Vec<u8> = sig1.serialize().unwrap().into();
        let beacon1 = Beacon::new(1, beacon0.randomness.clone(), sig1_bytes);

        assert!(verify_chained::<DefaultScheme>(&pk, &beacon0, &beacon1));

        // Broken linkage.
        let mut forked = beacon1.clone();
        forked.previous_rand = vec![0; 32];
        assert!(!verify_chained::<DefaultScheme>(&pk, &beacon0, &forked));

        // Tampered randomness.
        let mut tampered = beacon1.clone();
        tampered.randomness[0] ^= 0xff;
        assert!(!verify_chained::<DefaultScheme>(&pk, &beacon0, &tampered));
    }
}
