use super::keys::Identity;
use super::{KeyPoint, Scheme};

use anyhow::bail;
use anyhow::Result;
use energon::traits::Affine;
use sha2::{Digest, Sha256};

/// Group member: an identity pinned to its stable index. The index is the
/// party number used throughout the DKG and threshold reconstruction.
#[derive(Debug, PartialEq, Clone)]
pub struct Node<S: Scheme> {
    identity: Identity<S>,
    index: u32,
}

impl<S: Scheme> Node<S> {
    pub fn new(identity: Identity<S>, index: u32) -> Self {
        Self { identity, index }
    }

    pub fn identity(&self) -> &Identity<S> {
        &self.identity
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Ordered set of identities plus the signing threshold. Fixed for the
/// lifetime of the group.
#[derive(Debug, PartialEq, Clone)]
pub struct Group<S: Scheme> {
    pub nodes: Vec<Node<S>>,
    pub threshold: u32,
}

impl<S: Scheme> Group<S> {
    /// Assembles a fresh descriptor, assigning indices by position.
    pub fn from_identities(identities: Vec<Identity<S>>, threshold: u32) -> Result<Self> {
        let nodes = identities
            .into_iter()
            .enumerate()
            .map(|(index, identity)| Node::new(identity, index as u32))
            .collect();

        Self::new(nodes, threshold)
    }

    pub fn new(nodes: Vec<Node<S>>, threshold: u32) -> Result<Self> {
        let n = nodes.len() as u32;
        if n == 0 {
            bail!("group: empty node list");
        }
        if threshold == 0 || threshold > n {
            bail!("group: invalid threshold {threshold} for {n} nodes");
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i]
                .iter()
                .any(|other| other.identity().address() == node.identity().address())
            {
                bail!("group: duplicated address {}", node.identity().address());
            }
        }

        Ok(Self { nodes, threshold })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deterministic round leader: every node computes the same value
    /// locally, no election.
    pub fn leader(&self, round: u64) -> &Node<S> {
        &self.nodes[(round % self.nodes.len() as u64) as usize]
    }

    pub fn node(&self, index: u32) -> Option<&Node<S>> {
        self.nodes.iter().find(|node| node.index() == index)
    }

    pub fn find_index(&self, identity: &Identity<S>) -> Option<u32> {
        self.nodes
            .iter()
            .find(|node| node.identity().key() == identity.key())
            .map(Node::index)
    }

    pub fn public_key(&self, index: u32) -> Result<&KeyPoint<S>> {
        match self.node(index) {
            Some(node) => Ok(node.identity().key()),
            None => bail!("public key not found for index {index}"),
        }
    }

    /// Session nonce for the DKG sub-protocol, bound to the group contents.
    pub fn nonce(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.threshold.to_be_bytes());
        for node in &self.nodes {
            hasher.update(node.index().to_be_bytes());
            if let Ok(key) = node.identity().key().serialize() {
                let key: Vec<u8> = key.into();
                hasher.update(&key);
            }
        }

        hasher.finalize().into()
    }
}

/// Default threshold for `n` participants, `n/2 + 1`.
pub fn default_threshold(n: usize) -> u32 {
    (n as u32 / 2) + 1
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::utils::Address;
    use energon::drand::schemes::DefaultScheme;

    fn test_group(n: usize, threshold: u32) -> Group<DefaultScheme> {
        let identities = (0..n)
            .map(|i| {
                let address = Address::precheck(&format!("127.0.0.1:{}", 9000 + i)).unwrap();
                crate::key::keys::Pair::generate(address, false)
                    .public_identity()
                    .clone()
            })
            .collect();

        Group::from_identities(identities, threshold).unwrap()
    }

    #[test]
    fn indices_are_dense_and_positional() {
        let group = test_group(5, 3);
        for (i, node) in group.nodes.iter().enumerate() {
            assert_eq!(node.index(), i as u32);
        }
    }

    #[test]
    fn leader_rotation_wraps() {
        let group = test_group(4, 3);
        assert_eq!(group.leader(0).index(), 0);
        assert_eq!(group.leader(3).index(), 3);
        assert_eq!(group.leader(4).index(), 0);
        assert_eq!(group.leader(7).index(), 3);
    }

    #[test]
    fn threshold_bounds_are_enforced() {
        let group = test_group(3, 3);
        assert_eq!(group.threshold, 3);

        let identities: Vec<_> = group
            .nodes
            .into_iter()
            .map(|node| node.identity().clone())
            .collect();
        assert!(Group::<DefaultScheme>::from_identities(identities.clone(), 0).is_err());
        assert!(Group::<DefaultScheme>::from_identities(identities, 4).is_err());
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let address = Address::precheck("127.0.0.1:9000").unwrap();
        let a = crate::key::keys::Pair::<DefaultScheme>::generate(address.clone(), false)
            .public_identity()
            .clone();
        let b = crate::key::keys::Pair::<DefaultScheme>::generate(address, false)
            .public_identity()
            .clone();

        assert!(Group::from_identities(vec![a, b], 1).is_err());
    }

    #[test]
    fn default_threshold_is_majority() {
        assert_eq!(default_threshold(3), 2);
        assert_eq!(default_threshold(5), 3);
    }
}
