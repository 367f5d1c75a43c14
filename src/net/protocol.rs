//! This module provides server and client implementations for Protocol.

use super::utils::{connect, connect_lazy, Address, ClientTls, NewTcpListener, ToStatus};
use crate::core::daemon::Daemon;
use crate::key::Scheme;
use crate::protobuf::quorand as protobuf;

use protobuf::protocol_client::ProtocolClient as _ProtocolClient;
use protobuf::protocol_server::{Protocol, ProtocolServer};
use protobuf::{
    BeaconPacket, BeaconRequest, BeaconResponse, DkgPacket, DkgResponse, PrivateRandRequest,
    PrivateRandResponse, PublicRandRequest, PublicRandResponse, SyncRequest,
};

use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Identity as TlsIdentity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use tracing::error;

#[derive(thiserror::Error, Debug)]
pub enum StartServerError {
    #[error("failed to start node server")]
    FailedToStartNode,
    #[error("invalid server TLS configuration")]
    InvalidTlsConfig,
}

/// Implementor for [`Protocol`] trait for use with `ProtocolServer`.
pub struct ProtocolHandler<S: Scheme>(Arc<Daemon<S>>);

#[tonic::async_trait]
impl<S: Scheme> Protocol for ProtocolHandler<S> {
    /// Server streaming response type for the `sync_chain` method.
    type SyncChainStream = Pin<Box<dyn Stream<Item = Result<BeaconPacket, Status>> + Send>>;

    async fn setup(&self, request: Request<DkgPacket>) -> Result<Response<DkgResponse>, Status> {
        self.0
            .setup(request.into_inner())
            .await
            .map_err(|err| err.to_status())?;

        Ok(Response::new(DkgResponse {}))
    }

    async fn new_beacon(
        &self,
        request: Request<BeaconRequest>,
    ) -> Result<Response<BeaconResponse>, Status> {
        let response = self
            .0
            .new_beacon(request.into_inner())
            .await
            .map_err(|err| err.to_status())?;

        Ok(Response::new(response))
    }

    async fn public(
        &self,
        _request: Request<PublicRandRequest>,
    ) -> Result<Response<PublicRandResponse>, Status> {
        let response = self.0.public().await.map_err(|err| err.to_status())?;

        Ok(Response::new(response))
    }

    async fn private(
        &self,
        request: Request<PrivateRandRequest>,
    ) -> Result<Response<PrivateRandResponse>, Status> {
        let response = self
            .0
            .private(&request.into_inner().request)
            .map_err(|err| err.to_status())?;

        Ok(Response::new(PrivateRandResponse { response }))
    }

    async fn sync_chain(
        &self,
        request: Request<SyncRequest>,
    ) -> Result<Response<Self::SyncChainStream>, Status> {
        let from_round = request.into_inner().from_round;
        let stream_rx = self
            .0
            .sync(from_round)
            .await
            .map_err(|err| err.to_status())?;

        let stream = ReceiverStream::new(stream_rx)
            .map(|result| result.map(BeaconPacket::from).map_err(|err| err.to_status()));

        Ok(Response::new(Box::pin(stream)))
    }
}

pub async fn start_server<S: Scheme, N: NewTcpListener>(
    daemon: Arc<Daemon<S>>,
    node_listener: N::Config,
) -> Result<(), StartServerError> {
    let listener = N::bind(node_listener).await.map_err(|err| {
        error!("listener: {}, {}", StartServerError::FailedToStartNode, err);
        StartServerError::FailedToStartNode
    })?;
    let cancel = daemon.token.clone();

    let mut builder = Server::builder();
    if let Some((cert, key)) = daemon.server_tls().map_err(|err| {
        error!("{}: {err}", StartServerError::InvalidTlsConfig);
        StartServerError::InvalidTlsConfig
    })? {
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(TlsIdentity::from_pem(cert, key)))
            .map_err(|err| {
                error!("{}: {err}", StartServerError::InvalidTlsConfig);
                StartServerError::InvalidTlsConfig
            })?;
    }

    let (_health_reporter, health_service) = tonic_health::server::health_reporter();
    builder
        .add_service(ProtocolServer::new(ProtocolHandler(daemon)))
        .add_service(health_service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            let () = cancel.cancelled().await;
        })
        .await
        .map_err(|err| {
            error!("{}, {err}", StartServerError::FailedToStartNode);
            StartServerError::FailedToStartNode
        })?;

    Ok(())
}

#[derive(Clone)]
pub struct ProtocolClient {
    client: _ProtocolClient<Channel>,
}

impl ProtocolClient {
    /// Client over a lazy channel; the connection is established on first
    /// use and kept alive between rounds.
    pub fn lazy(address: &Address, tls: Option<&ClientTls>) -> anyhow::Result<Self> {
        let channel = connect_lazy(address, tls)?;

        Ok(Self {
            client: _ProtocolClient::new(channel),
        })
    }

    pub async fn connect(address: &Address, tls: Option<&ClientTls>) -> anyhow::Result<Self> {
        let channel = connect(address, tls).await?;

        Ok(Self {
            client: _ProtocolClient::new(channel),
        })
    }

    pub async fn setup(&mut self, packet: DkgPacket) -> Result<(), Status> {
        let _ = self.client.setup(packet).await?;

        Ok(())
    }

    pub async fn new_beacon(&mut self, request: BeaconRequest) -> Result<BeaconResponse, Status> {
        let response = self.client.new_beacon(request).await?;

        Ok(response.into_inner())
    }

    pub async fn public(&mut self) -> Result<PublicRandResponse, Status> {
        let response = self.client.public(PublicRandRequest {}).await?;

        Ok(response.into_inner())
    }

    pub async fn private_rand(&mut self, request: Vec<u8>) -> Result<Vec<u8>, Status> {
        let response = self.client.private(PrivateRandRequest { request }).await?;

        Ok(response.into_inner().response)
    }

    pub async fn sync_chain(&mut self, from_round: u64) -> Result<Streaming<BeaconPacket>, Status> {
        let stream = self
            .client
            .sync_chain(SyncRequest { from_round })
            .await?
            .into_inner();

        Ok(stream)
    }
}
