use crate::beacon::store::PutCallback;
use crate::beacon::DEFAULT_SEED;
use crate::net::utils::{ClientTls, Seconds};

use std::path::PathBuf;
use std::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("need to set --insecure if no certificate and private key path given")]
    TlsMaterialMissing,
    #[error("tls material is not readable: {0}")]
    TlsMaterialUnreadable(String),
}

/// Runtime options of a node. The group descriptor and key material live in
/// the file store; everything else is configured here.
pub struct Config {
    pub folder: PathBuf,
    pub period: Seconds,
    pub dkg_timeout: Seconds,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub certs_dir: Option<PathBuf>,
    pub insecure: bool,
    /// Genesis `previous_randomness` of round 0.
    pub seed: Vec<u8>,
    /// Post-commit hooks for the beacon store, drained once at startup.
    callbacks: Mutex<Vec<PutCallback>>,
}

impl Config {
    pub fn new(folder: PathBuf, period: Seconds, dkg_timeout: Seconds) -> Self {
        Self {
            folder,
            period,
            dkg_timeout,
            tls_cert: None,
            tls_key: None,
            certs_dir: None,
            insecure: false,
            seed: DEFAULT_SEED.to_vec(),
            callbacks: Mutex::new(vec![]),
        }
    }

    pub fn with_tls(mut self, cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        self.tls_cert = cert;
        self.tls_key = key;
        self
    }

    pub fn with_certs_dir(mut self, certs_dir: Option<PathBuf>) -> Self {
        self.certs_dir = certs_dir;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Registers a hook invoked synchronously after every stored beacon.
    pub fn register_callback(&self, callback: PutCallback) {
        self.callbacks
            .lock()
            .expect("callbacks mutex poisoned")
            .push(callback);
    }

    pub(crate) fn take_callbacks(&self) -> Vec<PutCallback> {
        std::mem::take(&mut self.callbacks.lock().expect("callbacks mutex poisoned"))
    }

    /// A non-insecure node must bring server TLS material.
    pub fn check(&self) -> Result<(), ConfigError> {
        if !self.insecure && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(ConfigError::TlsMaterialMissing);
        }

        Ok(())
    }

    /// TLS options for outbound channels to peers with the `tls` flag set.
    pub fn client_tls(&self) -> ClientTls {
        ClientTls {
            certs_dir: self.certs_dir.clone(),
        }
    }

    /// Server identity PEMs, when TLS is enabled.
    pub fn server_tls_pem(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, ConfigError> {
        self.check()?;
        if self.insecure {
            return Ok(None);
        }

        let read = |path: &PathBuf| {
            std::fs::read(path)
                .map_err(|err| ConfigError::TlsMaterialUnreadable(format!("{}: {err}", path.display())))
        };
        let cert = read(self.tls_cert.as_ref().expect("checked above"))?;
        let key = read(self.tls_key.as_ref().expect("checked above"))?;

        Ok(Some((cert, key)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secure_config_requires_tls_material() {
        let config = Config::new("/tmp/x".into(), Seconds::new(30), Seconds::new(60));
        assert!(matches!(config.check(), Err(ConfigError::TlsMaterialMissing)));

        let config = config.with_insecure(true);
        assert!(config.check().is_ok());
    }

    #[test]
    fn callbacks_are_drained_once() {
        let config = Config::new("/tmp/x".into(), Seconds::new(30), Seconds::new(60));
        config.register_callback(Box::new(|_| {}));
        config.register_callback(Box::new(|_| {}));

        assert_eq!(config.take_callbacks().len(), 2);
        assert!(config.take_callbacks().is_empty());
    }
}
