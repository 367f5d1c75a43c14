//! Hybrid encryption for the one-shot private randomness exchange.
//!
//! Fixed suite, identical on every peer: X25519 key agreement, HKDF-SHA256
//! with a protocol tag, AES-256-GCM. Ciphertext framing is
//! `ephemeral_pub(32) || nonce(12) || aead_ciphertext`, with the ephemeral
//! public key doubling as AEAD associated data. A mismatch on either side
//! surfaces as a failed decryption, never as garbage plaintext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Domain tag of the key schedule. Frozen; changing it breaks every peer.
const KDF_TAG: &[u8] = b"quorand-ecies-v1";
/// Tag for deriving the long-term encryption key from the signing scalar.
const KEY_DERIVE_TAG: &[u8] = b"quorand-ecies-longterm-v1";

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
/// Size of the randomness handed to private clients.
pub const RAND_SIZE: usize = 32;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EciesError {
    #[error("invalid ECIES request")]
    InvalidRequest,
    #[error("error gathering randomness")]
    RngFailure,
}

/// Long-term or ephemeral X25519 keypair.
pub struct EciesKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EciesKeypair {
    /// Fresh ephemeral keypair from the OS CSPRNG.
    pub fn generate() -> Result<Self, EciesError> {
        let mut seed = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut seed).map_err(|_| EciesError::RngFailure)?;
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        seed.zeroize();

        Ok(Self { secret, public })
    }

    /// Deterministic keypair from seed material (the node's signing scalar),
    /// so the encryption key needs no separate persistence.
    pub fn derive(seed: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, seed);
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(KEY_DERIVE_TAG, &mut okm)
            .expect("32 bytes is a valid hkdf output length");

        let secret = StaticSecret::from(okm);
        let public = PublicKey::from(&secret);
        okm.zeroize();

        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }
}

/// Symmetric key for one direction of one exchange.
fn shared_key(
    secret: &StaticSecret,
    peer: &PublicKey,
    ephemeral_pub: &[u8; KEY_SIZE],
    recipient_pub: &[u8; KEY_SIZE],
) -> Result<[u8; KEY_SIZE], EciesError> {
    let shared = secret.diffie_hellman(peer);
    // Identity and low-order peer points never reach the KDF.
    if !shared.was_contributory() {
        return Err(EciesError::InvalidRequest);
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut info = Vec::with_capacity(KDF_TAG.len() + 2 * KEY_SIZE);
    info.extend_from_slice(KDF_TAG);
    info.extend_from_slice(ephemeral_pub);
    info.extend_from_slice(recipient_pub);

    let mut okm = [0u8; KEY_SIZE];
    hk.expand(&info, &mut okm)
        .expect("32 bytes is a valid hkdf output length");

    Ok(okm)
}

/// Encrypts `plaintext` to `recipient` under a fresh ephemeral key.
pub fn encrypt(recipient: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, EciesError> {
    let recipient_pub = PublicKey::from(*recipient);
    let ephemeral = EciesKeypair::generate()?;
    let ephemeral_pub = ephemeral.public_bytes();

    let mut key = shared_key(&ephemeral.secret, &recipient_pub, &ephemeral_pub, recipient)?;
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
    key.zeroize();

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce_bytes).map_err(|_| EciesError::RngFailure)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &ephemeral_pub,
            },
        )
        .map_err(|_| EciesError::InvalidRequest)?;

    let mut out = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&ephemeral_pub);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);

    Ok(out)
}

/// Decrypts a ciphertext addressed to `keypair`.
pub fn decrypt(keypair: &EciesKeypair, ciphertext: &[u8]) -> Result<Vec<u8>, EciesError> {
    if ciphertext.len() <= KEY_SIZE + NONCE_SIZE {
        return Err(EciesError::InvalidRequest);
    }
    let (ephemeral_pub, rest) = ciphertext.split_at(KEY_SIZE);
    let (nonce_bytes, sealed) = rest.split_at(NONCE_SIZE);

    let ephemeral_arr: [u8; KEY_SIZE] = ephemeral_pub
        .try_into()
        .map_err(|_| EciesError::InvalidRequest)?;
    let peer = PublicKey::from(ephemeral_arr);

    let mut key = shared_key(
        &keypair.secret,
        &peer,
        &ephemeral_arr,
        &keypair.public_bytes(),
    )?;
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
    key.zeroize();

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: sealed,
                aad: ephemeral_pub,
            },
        )
        .map_err(|_| EciesError::InvalidRequest)
}

/// Server side of the exchange: recover the client's ephemeral key from the
/// request, draw fresh randomness, encrypt it back.
pub fn answer_request(
    keypair: &EciesKeypair,
    request: &[u8],
) -> Result<Vec<u8>, EciesError> {
    let client_key = decrypt(keypair, request)?;
    let client_key: [u8; KEY_SIZE] = client_key
        .as_slice()
        .try_into()
        .map_err(|_| EciesError::InvalidRequest)?;

    let mut randomness = [0u8; RAND_SIZE];
    getrandom::getrandom(&mut randomness).map_err(|_| EciesError::RngFailure)?;

    let response = encrypt(&client_key, &randomness);
    randomness.zeroize();

    response
}

/// Client side: build a request for `server`, keep the ephemeral keypair to
/// open the response with [`open_response`].
pub fn new_request(server: &[u8; KEY_SIZE]) -> Result<(EciesKeypair, Vec<u8>), EciesError> {
    let ephemeral = EciesKeypair::generate()?;
    let request = encrypt(server, &ephemeral.public_bytes())?;

    Ok((ephemeral, request))
}

pub fn open_response(
    ephemeral: &EciesKeypair,
    response: &[u8],
) -> Result<[u8; RAND_SIZE], EciesError> {
    let plaintext = decrypt(ephemeral, response)?;
    plaintext
        .as_slice()
        .try_into()
        .map_err(|_| EciesError::InvalidRequest)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let server = EciesKeypair::generate().unwrap();
        let msg = b"thirty-two bytes of randomness!!";

        let sealed = encrypt(&server.public_bytes(), msg).unwrap();
        let opened = decrypt(&server, &sealed).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn full_exchange_yields_distinct_randomness() {
        let server = EciesKeypair::derive(b"some deterministic seed material");

        let (eph1, req1) = new_request(&server.public_bytes()).unwrap();
        let (eph2, req2) = new_request(&server.public_bytes()).unwrap();
        assert_ne!(req1, req2);

        let resp1 = answer_request(&server, &req1).unwrap();
        let resp2 = answer_request(&server, &req2).unwrap();

        let rand1 = open_response(&eph1, &resp1).unwrap();
        let rand2 = open_response(&eph2, &resp2).unwrap();
        assert_eq!(rand1.len(), RAND_SIZE);
        assert_ne!(rand1, rand2);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let server = EciesKeypair::generate().unwrap();
        let mut sealed = encrypt(&server.public_bytes(), b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert_eq!(decrypt(&server, &sealed), Err(EciesError::InvalidRequest));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let server = EciesKeypair::generate().unwrap();
        assert_eq!(
            decrypt(&server, &[0u8; KEY_SIZE + NONCE_SIZE]),
            Err(EciesError::InvalidRequest)
        );
    }

    #[test]
    fn request_to_the_wrong_key_is_rejected() {
        let server = EciesKeypair::generate().unwrap();
        let other = EciesKeypair::generate().unwrap();

        let (_eph, request) = new_request(&other.public_bytes()).unwrap();
        assert_eq!(
            answer_request(&server, &request),
            Err(EciesError::InvalidRequest)
        );
    }

    #[test]
    fn derived_keypair_is_deterministic() {
        let a = EciesKeypair::derive(b"seed");
        let b = EciesKeypair::derive(b"seed");
        assert_eq!(a.public_bytes(), b.public_bytes());
    }
}
