use super::Scheme;
use crate::ecies::{EciesError, EciesKeypair};
use crate::key::KeyPoint;
use crate::net::utils::Address;

use energon::cyber::poly::PubPoly;
use energon::traits::{Affine, ScalarField};

use std::fmt::Display;

/// Long-term keypair of a node. The public half is the [`Identity`] other
/// nodes keep in their group descriptor.
#[derive(Debug, PartialEq)]
pub struct Pair<S: Scheme> {
    private: S::Scalar,
    public: Identity<S>,
}

impl<S: Scheme> Pair<S> {
    pub fn generate(address: Address, tls: bool) -> Self {
        let private = S::Scalar::random();
        let key = S::sk_to_pk(&private);

        Self {
            private,
            public: Identity { address, key, tls },
        }
    }

    pub fn set(private: S::Scalar, public: Identity<S>) -> Self {
        Self { private, public }
    }

    pub fn private_key(&self) -> &S::Scalar {
        &self.private
    }

    pub fn public_identity(&self) -> &Identity<S> {
        &self.public
    }

    /// Long-term encryption keypair for the private randomness path,
    /// derived deterministically from the signing scalar.
    pub fn ecies_keypair(&self) -> Result<EciesKeypair, EciesError> {
        let seed: Vec<u8> = self
            .private
            .to_bytes_be()
            .map_err(|_| EciesError::InvalidRequest)?
            .into();

        Ok(EciesKeypair::derive(&seed))
    }
}

/// Public identity of a group member: `(address, long-term key, tls flag)`.
#[derive(Debug, PartialEq, Clone)]
pub struct Identity<S: Scheme> {
    pub address: Address,
    pub key: KeyPoint<S>,
    pub tls: bool,
}

impl<S: Scheme> Identity<S> {
    pub fn new(address: Address, tls: bool, key: KeyPoint<S>) -> Self {
        Self { address, key, tls }
    }

    pub fn key(&self) -> &KeyPoint<S> {
        &self.key
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl<S: Scheme> Display for Identity<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let key = self
            .key
            .serialize()
            .map(|bytes| {
                let bytes: Vec<u8> = bytes.into();
                hex::encode(bytes)
            })
            .unwrap_or_default();
        write!(
            f,
            "Address = {}\nKey = {}\nTLS = {}\nSchemeName = {}",
            self.address,
            key,
            self.tls,
            S::ID
        )
    }
}

/// Polynomial commitment of the distributed key, degree `t - 1`.
/// The constant term is the group public key; the evaluation at index `i`
/// is the verification key of share `i`.
#[derive(Debug, PartialEq, Clone)]
pub struct DistPublic<S: Scheme> {
    pub commits: Vec<KeyPoint<S>>,
}

impl<S: Scheme> DistPublic<S> {
    pub fn new(commits: Vec<KeyPoint<S>>) -> Self {
        Self { commits }
    }

    pub fn public_key(&self) -> &KeyPoint<S> {
        &self.commits[0]
    }

    pub fn poly(&self) -> PubPoly<S> {
        PubPoly {
            commits: self.commits.clone(),
        }
    }

    pub fn commits(&self) -> &[KeyPoint<S>] {
        &self.commits
    }
}
