use crate::beacon::handler::BeaconError;
use crate::beacon::store::StoreError;
use crate::core::daemon::DaemonError;
use crate::dkg::DkgError;
use crate::ecies::EciesError;

use http::uri::Authority;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::Status;

/// Connection timeout for transport channel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Address is protected type of URI Authority which always contains host:port
/// (see [`Address::precheck`]).
#[derive(Eq, PartialEq, Clone)]
pub struct Address(Authority);

impl Address {
    pub fn precheck(data: &str) -> Result<Self, InvalidAddress> {
        let authority = data
            .parse::<http::uri::Authority>()
            .map_err(|err| InvalidAddress(format!("{data}, source: {err:?}")))?;

        if authority.host().is_empty() || authority.port().is_none() {
            return Err(InvalidAddress(data.into()));
        }

        Ok(Self(authority))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_str().cmp(other.0.as_str())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("expected valid host:port, received {0}")]
pub struct InvalidAddress(String);

/// Client-side TLS material. The per-peer `tls` flag of the group descriptor
/// decides whether it is applied at all.
#[derive(Clone, Default)]
pub struct ClientTls {
    /// Directory with trusted PEM certificates, for self-signed test setups.
    pub certs_dir: Option<PathBuf>,
}

impl ClientTls {
    fn config(&self) -> anyhow::Result<ClientTlsConfig> {
        let mut tls = ClientTlsConfig::new().with_native_roots();
        if let Some(dir) = &self.certs_dir {
            tls = tls.ca_certificate(Certificate::from_pem(read_pem_bundle(dir)?));
        }

        Ok(tls)
    }
}

/// Concatenates every PEM file in `dir` into one trust bundle.
fn read_pem_bundle(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let mut bundle = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "pem" || ext == "crt") {
            bundle.extend_from_slice(&std::fs::read(&path)?);
            bundle.push(b'\n');
        }
    }

    Ok(bundle)
}

/// Returns a channel for a generic Tonic client.
/// Does not attempt to connect to the endpoint until first use.
pub fn connect_lazy(peer: &Address, tls: Option<&ClientTls>) -> anyhow::Result<Channel> {
    let channel = match tls {
        Some(tls) => Channel::from_shared(format!("https://{peer}"))?
            .tls_config(tls.config()?)?,
        None => Channel::from_shared(format!("http://{peer}"))?,
    }
    .connect_timeout(CONNECT_TIMEOUT)
    .keep_alive_while_idle(true)
    .keep_alive_timeout(Duration::from_secs(60))
    .connect_lazy();

    Ok(channel)
}

/// Returns a connected channel for a generic Tonic client.
pub async fn connect(peer: &Address, tls: Option<&ClientTls>) -> anyhow::Result<Channel> {
    let channel = match tls {
        Some(tls) => Channel::from_shared(format!("https://{peer}"))?
            .tls_config(tls.config()?)?,
        None => Channel::from_shared(format!("http://{peer}"))?,
    }
    .connect_timeout(CONNECT_TIMEOUT)
    .connect()
    .await?;

    Ok(channel)
}

#[derive(Debug, Default, PartialEq, Copy, Clone)]
pub struct Seconds {
    value: u32,
}

impl Seconds {
    pub fn new(value: u32) -> Self {
        Self { value }
    }

    pub fn get_value(self) -> u32 {
        self.value
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.value.into())
    }
}

impl From<u32> for Seconds {
    fn from(value: u32) -> Self {
        Seconds { value }
    }
}

impl std::fmt::Display for Seconds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.value)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("expected seconds in the form '30s'")]
pub struct ParseSecondsError;

impl FromStr for Seconds {
    type Err = ParseSecondsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value
            .strip_suffix('s')
            .ok_or(ParseSecondsError)?
            .parse()
            .map_err(|_| ParseSecondsError)?;

        Ok(Self::new(value))
    }
}

/// Helper trait for binding TCP listeners.
pub trait NewTcpListener {
    type Error: Display;
    type Config;

    fn bind(
        config: Self::Config,
    ) -> impl std::future::Future<Output = Result<TcpListener, Self::Error>>;
}

pub struct NodeListener;

#[allow(dead_code, reason = "reserved for tests")]
pub struct TestListener;

impl NewTcpListener for NodeListener {
    type Error = std::io::Error;
    // Prechecked Authority
    type Config = Address;

    /// Attempt to bind a listener for the internet-facing node address.
    async fn bind(address: Self::Config) -> Result<TcpListener, std::io::Error> {
        TcpListener::bind(address.as_str()).await
    }
}

#[cfg(test)]
impl NewTcpListener for TestListener {
    type Error = std::convert::Infallible;
    type Config = TcpListener;

    async fn bind(test: Self::Config) -> Result<TcpListener, Self::Error> {
        Ok(test)
    }
}

/// Converts the underlying error into a [`Status`].
pub trait ToStatus {
    fn to_status(&self) -> Status;
}

impl ToStatus for tokio::sync::oneshot::error::RecvError {
    /// This error should not be possible. Means that callback sender is
    /// dropped without sending.
    fn to_status(&self) -> Status {
        Status::internal("internal error*")
    }
}

impl ToStatus for StoreError {
    fn to_status(&self) -> Status {
        match self {
            StoreError::NoBeacon | StoreError::NotFound => Status::not_found(self.to_string()),
            _ => Status::aborted(self.to_string()),
        }
    }
}

impl ToStatus for BeaconError {
    fn to_status(&self) -> Status {
        match self {
            BeaconError::NotReady { .. } => Status::failed_precondition(self.to_string()),
            _ => Status::aborted(self.to_string()),
        }
    }
}

impl ToStatus for DaemonError {
    fn to_status(&self) -> Status {
        match self {
            DaemonError::DkgNotFinished
            | DaemonError::DkgFinished
            | DaemonError::Beacon(BeaconError::NotReady { .. }) => {
                Status::failed_precondition(self.to_string())
            }
            _ => Status::aborted(self.to_string()),
        }
    }
}

impl ToStatus for DkgError {
    fn to_status(&self) -> Status {
        Status::aborted(self.to_string())
    }
}

impl ToStatus for EciesError {
    fn to_status(&self) -> Status {
        match self {
            EciesError::InvalidRequest => Status::invalid_argument(self.to_string()),
            EciesError::RngFailure => Status::internal(self.to_string()),
        }
    }
}

impl ToStatus for InvalidAddress {
    fn to_status(&self) -> Status {
        Status::invalid_argument(self.0.clone())
    }
}

pub struct Callback<T, E: Error> {
    inner: oneshot::Sender<Result<T, E>>,
}

impl<T, E: Error> Callback<T, E> {
    pub fn new() -> (Self, oneshot::Receiver<Result<T, E>>) {
        let (tx, rx) = oneshot::channel();
        (Self { inner: tx }, rx)
    }

    #[inline]
    pub fn reply(self, result: Result<T, E>) {
        let _ = self.inner.send(result);
    }
}
