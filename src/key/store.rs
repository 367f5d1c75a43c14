use super::group::Group;
use super::keys::{DistPublic, Identity, Pair};
use super::toml::{FromToml, IntoToml, PrivateKeyToml};
use super::Scheme;

use energon::kyber::dkg::DistKeyShare;

use anyhow::bail;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_FOLDER: &str = ".quorand";
const KEY_FOLDER: &str = "key";
const GROUP_FOLDER: &str = "groups";
const SHARE_FOLDER: &str = "shares";
const DB_FOLDER: &str = "db";
const PRIVATE_ID_FILE: &str = "quorand_id.private";
const PUBLIC_ID_FILE: &str = "quorand_id.public";
const GROUP_FILE: &str = "quorand_group.toml";
const PRIVATE_SHARE_FILE: &str = "dist_key.private";
const PUBLIC_DIST_KEY_FILE: &str = "dist_key.public";

/// On-disk layout of a node:
/// `key/` long-term keypair, `groups/` descriptor, `shares/` DKG output,
/// `db/` beacon store.
#[derive(Debug, Clone)]
pub struct FileStore {
    inner: Arc<InnerFS>,
}

#[derive(Debug)]
pub struct InnerFS {
    base_folder: PathBuf,
    private_key_file: PathBuf,
    public_key_file: PathBuf,
    group_file: PathBuf,
    private_share_file: PathBuf,
    public_dist_key_file: PathBuf,
}

impl FileStore {
    pub fn set(base_folder: &Path) -> Self {
        let key_folder = base_folder.join(KEY_FOLDER);
        let group_folder = base_folder.join(GROUP_FOLDER);
        let share_folder = base_folder.join(SHARE_FOLDER);

        Self {
            inner: Arc::new(InnerFS {
                private_key_file: key_folder.join(PRIVATE_ID_FILE),
                public_key_file: key_folder.join(PUBLIC_ID_FILE),
                group_file: group_folder.join(GROUP_FILE),
                private_share_file: share_folder.join(PRIVATE_SHARE_FILE),
                public_dist_key_file: share_folder.join(PUBLIC_DIST_KEY_FILE),
                base_folder: base_folder.to_path_buf(),
            }),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_folder.join(DB_FOLDER)
    }

    pub fn save_key_pair<S: Scheme>(&self, pair: &Pair<S>) -> Result<()> {
        if self.private_key_file.exists() {
            bail!(
                "keypair already present in {}, remove it before generating a new one",
                self.private_key_file.display()
            )
        }
        create_secure_dir(self.private_key_file.parent().expect("key folder"))?;

        let mut public = pair.public_identity().to_value()?;
        if let Some(table) = public.as_table_mut() {
            table.insert(
                "EncryptionKey".into(),
                hex::encode(pair.ecies_keypair()?.public_bytes()).into(),
            );
        }

        std::fs::write(
            &self.private_key_file,
            PrivateKeyToml::<S>(pair.private_key().to_owned()).to_toml()?,
        )?;
        std::fs::write(&self.public_key_file, toml::to_string(&public)?)?;

        Ok(())
    }

    pub fn load_key_pair<S: Scheme>(&self) -> Result<Pair<S>> {
        let private = PrivateKeyToml::<S>::from_toml(&read_to_string(&self.private_key_file)?)?;
        let public = Identity::from_toml(&read_to_string(&self.public_key_file)?)?;

        Ok(Pair::set(private.0, public))
    }

    pub fn save_share<S: Scheme>(&self, share: &DistKeyShare<S>) -> Result<&PathBuf> {
        create_secure_dir(self.private_share_file.parent().expect("share folder"))?;
        std::fs::write(&self.private_share_file, share.to_toml()?)?;

        Ok(&self.private_share_file)
    }

    pub fn load_share<S: Scheme>(&self) -> Result<DistKeyShare<S>> {
        DistKeyShare::from_toml(&read_to_string(&self.private_share_file)?)
    }

    pub fn save_dist_public<S: Scheme>(&self, dist: &DistPublic<S>) -> Result<()> {
        create_secure_dir(self.public_dist_key_file.parent().expect("share folder"))?;
        std::fs::write(&self.public_dist_key_file, dist.to_toml()?)?;

        Ok(())
    }

    pub fn load_dist_public<S: Scheme>(&self) -> Result<DistPublic<S>> {
        DistPublic::from_toml(&read_to_string(&self.public_dist_key_file)?)
    }

    pub fn save_group<S: Scheme>(&self, group: &Group<S>) -> Result<()> {
        create_secure_dir(self.group_file.parent().expect("group folder"))?;
        std::fs::write(&self.group_file, group.to_toml()?)?;

        Ok(())
    }

    pub fn load_group<S: Scheme>(&self) -> Result<Group<S>> {
        Group::from_toml(&read_to_string(&self.group_file)?)
    }

    /// A node restarts into the beacon loop iff the DKG output is on disk.
    pub fn has_distributed(&self) -> bool {
        self.private_share_file.exists()
            && self.public_dist_key_file.exists()
            && self.group_file.exists()
    }

    pub fn public_key_file(&self) -> &Path {
        &self.public_key_file
    }

    pub fn private_share_file(&self) -> &Path {
        &self.private_share_file
    }

    pub fn quorand_home() -> PathBuf {
        match home::home_dir() {
            Some(path) => path.join(DEFAULT_FOLDER),
            None => panic!("couldn't get home directory"),
        }
    }
}

fn create_secure_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if !path.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)?;
    }

    Ok(())
}

fn read_to_string(p: &Path) -> Result<String> {
    std::fs::read_to_string(p)
        .map_err(|e| anyhow::anyhow!("error reading: {}, {e:?}", p.display()))
}

impl std::ops::Deref for FileStore {
    type Target = InnerFS;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::utils::Address;
    use energon::drand::schemes::DefaultScheme;
    use tempfile::TempDir;

    #[test]
    fn keypair_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = FileStore::set(dir.path());

        let address = Address::precheck("127.0.0.1:7300").unwrap();
        let pair = Pair::<DefaultScheme>::generate(address, false);
        fs.save_key_pair(&pair).unwrap();

        let loaded = fs.load_key_pair::<DefaultScheme>().unwrap();
        assert_eq!(pair, loaded);

        // A second keygen must not clobber existing material.
        assert!(fs.save_key_pair(&pair).is_err());
    }

    #[test]
    fn fresh_store_has_no_distributed_material() {
        let dir = TempDir::new().unwrap();
        let fs = FileStore::set(dir.path());
        assert!(!fs.has_distributed());
    }
}
