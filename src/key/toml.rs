use super::group::{Group, Node};
use super::keys::{DistPublic, Identity};
use super::{KeyPoint, Scheme};
use crate::net::utils::Address;

use energon::kyber::dkg::DistKeyShare;
use energon::cyber::poly::PriShare;
use energon::traits::{Affine, ScalarField};

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;

use toml::value::Array;
use toml::Table;
use toml::Value;

/// Create Map<String, Value> from (key:&str, value:Value)
macro_rules! map {
    ($($key:literal : $value:expr),* $(,)?) => {
        {
            let kv = [$(($key.to_string(), $value.into())),*];
            IntoIterator::into_iter(kv).collect::<Table>()
        }
    };
}

/// Get value by $key:&str, define resulting type of value by $method
macro_rules! get {
    ($map:expr, $key:literal, $method:ident) => {
        $map.get($key)
            .and_then(|v| v.$method())
            .ok_or_else(|| anyhow::anyhow!(concat!("Expected ", $key)))
    };
}

fn hex_point<S: Scheme>(point: &KeyPoint<S>) -> Result<String> {
    let bytes: Vec<u8> = point
        .serialize()
        .map_err(|err| anyhow!("point serialization: {err:?}"))?
        .into();

    Ok(hex::encode(bytes))
}

fn hex_scalar<S: Scheme>(scalar: &S::Scalar) -> Result<String> {
    let bytes: Vec<u8> = scalar
        .to_bytes_be()
        .map_err(|err| anyhow!("scalar serialization: {err:?}"))?
        .into();

    Ok(hex::encode(bytes))
}

pub trait IntoToml: Sized {
    fn to_value(&self) -> Result<Value>;

    fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(&self.to_value()?)?)
    }
}

pub trait FromToml: Sized {
    fn from_value(value: &Value) -> Result<Self>;

    fn from_toml(toml: &str) -> Result<Self> {
        Self::from_value(&toml::from_str(toml)?)
    }
}

impl<S: Scheme> IntoToml for Identity<S> {
    fn to_value(&self) -> Result<Value> {
        let map = map![
             "Address":    self.address().as_str(),
             "Key":        hex_point::<S>(self.key())?,
             "TLS":        self.tls(),
             "SchemeName": S::ID,
        ];

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> FromToml for Identity<S> {
    fn from_value(value: &Value) -> Result<Self> {
        if let Some(scheme_str) = value.get("SchemeName").and_then(|v| v.as_str()) {
            if S::ID != scheme_str {
                bail!(
                    "fs: identity load error, expected scheme: {}, received: {scheme_str}",
                    S::ID
                )
            }
        }
        let address = Address::precheck(get!(value, "Address", as_str)?)?;
        let tls = get!(value, "TLS", as_bool)?;
        let key_bytes = hex::decode(get!(value, "Key", as_str)?)?;
        let key = Affine::deserialize(&key_bytes)
            .map_err(|err| anyhow!("fs: identity key: {err:?}"))?;

        Ok(Self::new(address, tls, key))
    }
}

impl<S: Scheme> IntoToml for Node<S> {
    fn to_value(&self) -> Result<Value> {
        let mut map = self
            .identity()
            .to_value()?
            .as_table()
            .expect("Value should be Table")
            .to_owned();
        map.extend(map! {"Index": self.index()});

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> IntoToml for Group<S> {
    fn to_value(&self) -> Result<Value> {
        let mut map = map! {
            "Threshold": self.threshold,
        };

        let mut nodes: Array = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            nodes.push(node.to_value()?);
        }
        map.insert("Nodes".to_string(), Value::Array(nodes));

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> FromToml for Group<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let threshold = get!(value, "Threshold", as_integer)? as u32;
        let nodes_array = get!(value, "Nodes", as_array)?;

        let mut nodes: Vec<Node<S>> = Vec::with_capacity(nodes_array.len());
        for (position, node) in nodes_array.iter().enumerate() {
            let identity = Identity::from_value(node)?;
            // A descriptor assembled before the DKG has positional indices;
            // the qualified group written after it carries them explicitly.
            let index = match node.get("Index").and_then(|v| v.as_integer()) {
                Some(index) => index as u32,
                None => position as u32,
            };
            nodes.push(Node::new(identity, index));
        }

        Group::new(nodes, threshold)
    }
}

/// Private long-term key file body.
pub struct PrivateKeyToml<S: Scheme>(pub S::Scalar);

impl<S: Scheme> IntoToml for PrivateKeyToml<S> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Table(map!("Key": hex_scalar::<S>(&self.0)?)))
    }
}

impl<S: Scheme> FromToml for PrivateKeyToml<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let bytes = hex::decode(get!(value, "Key", as_str)?)?;
        let scalar = S::Scalar::from_bytes_be(&bytes)
            .map_err(|err| anyhow!("fs: private key: {err:?}"))?;

        Ok(Self(scalar))
    }
}

impl<S: Scheme> IntoToml for DistKeyShare<S> {
    fn to_value(&self) -> Result<Value> {
        let mut config = map! {
            "Index": self.pri_share.index(),
            "Share": hex_scalar::<S>(&self.pri_share.v)?,
            "SchemeName": S::ID,
        };

        let mut commits: Array = Vec::with_capacity(self.commits.len());
        for commit in &self.commits {
            commits.push(Value::String(hex_point::<S>(commit)?));
        }
        config.insert("Commits".to_string(), Value::Array(commits));

        Ok(Value::Table(config))
    }
}

impl<S: Scheme> FromToml for DistKeyShare<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let scheme_str = get!(value, "SchemeName", as_str)?;
        if S::ID != scheme_str {
            bail!(
                "fs: share load error, expected scheme: {}, received: {scheme_str}",
                S::ID
            )
        }
        let i = get!(value, "Index", as_integer)? as u32;
        let share_bytes = hex::decode(get!(value, "Share", as_str)?)?;
        let v = S::Scalar::from_bytes_be(&share_bytes)
            .map_err(|err| anyhow!("fs: share scalar: {err:?}"))?;

        let commits_value = get!(value, "Commits", as_array)?;
        let mut commits: Vec<KeyPoint<S>> = Vec::with_capacity(commits_value.len());
        for commit in commits_value {
            match commit.as_str() {
                Some(commit) => commits.push(
                    Affine::deserialize(&hex::decode(commit)?)
                        .map_err(|err| anyhow!("fs: share commit: {err:?}"))?,
                ),
                None => bail!("fs: share load: commit is empty"),
            }
        }

        Ok(DistKeyShare {
            commits,
            pri_share: PriShare { i, v },
        })
    }
}

impl<S: Scheme> IntoToml for DistPublic<S> {
    fn to_value(&self) -> Result<Value> {
        let mut coefficients: Array = Vec::with_capacity(self.commits.len());
        for commit in self.commits() {
            coefficients.push(Value::String(hex_point::<S>(commit)?));
        }

        let mut map = Table::new();
        map.insert("Coefficients".to_string(), Value::Array(coefficients));
        map.insert("SchemeName".to_string(), Value::String(S::ID.to_string()));

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> FromToml for DistPublic<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let coefficients = get!(value, "Coefficients", as_array)?;
        if coefficients.is_empty() {
            bail!("Distributed public key is empty")
        }

        let mut commits: Vec<KeyPoint<S>> = Vec::with_capacity(coefficients.len());
        for commit in coefficients {
            match commit.as_str() {
                Some(commit) => commits.push(
                    Affine::deserialize(&hex::decode(commit)?)
                        .map_err(|err| anyhow!("fs: dist public: {err:?}"))?,
                ),
                None => bail!("fs: dist public: coefficient is empty"),
            }
        }

        Ok(DistPublic::new(commits))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::keys::Pair;
    use energon::drand::schemes::DefaultScheme;

    #[test]
    fn group_roundtrip() {
        let identities: Vec<Identity<DefaultScheme>> = (0..3)
            .map(|i| {
                let address = Address::precheck(&format!("127.0.0.1:{}", 7000 + i)).unwrap();
                Pair::generate(address, i == 0).public_identity().clone()
            })
            .collect();
        let group = Group::from_identities(identities, 2).unwrap();

        let encoded = group.to_toml().unwrap();
        let decoded: Group<DefaultScheme> = FromToml::from_toml(&encoded).unwrap();

        assert_eq!(group, decoded);
    }

    #[test]
    fn group_without_explicit_indices_is_positional() {
        let identities: Vec<Identity<DefaultScheme>> = (0..2)
            .map(|i| {
                let address = Address::precheck(&format!("127.0.0.1:{}", 7100 + i)).unwrap();
                Pair::generate(address, false).public_identity().clone()
            })
            .collect();
        let group = Group::from_identities(identities, 1).unwrap();

        // Strip the Index fields, as a hand-assembled descriptor would look.
        let mut value: Value = toml::from_str(&group.to_toml().unwrap()).unwrap();
        for node in value
            .get_mut("Nodes")
            .and_then(|v| v.as_array_mut())
            .unwrap()
        {
            node.as_table_mut().unwrap().remove("Index");
        }

        let decoded = Group::<DefaultScheme>::from_value(&value).unwrap();
        assert_eq!(group, decoded);
    }

    #[test]
    fn private_key_roundtrip() {
        let address = Address::precheck("127.0.0.1:7200").unwrap();
        let pair = Pair::<DefaultScheme>::generate(address, false);

        let encoded = PrivateKeyToml::<DefaultScheme>(pair.private_key().to_owned())
            .to_toml()
            .unwrap();
        let decoded = PrivateKeyToml::<DefaultScheme>::from_toml(&encoded).unwrap();

        assert!(pair.private_key() == &decoded.0);
    }
}
