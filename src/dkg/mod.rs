pub mod driver;

pub use driver::{DkgDriver, DkgResult};

use crate::key::keys::Identity;
use crate::key::{KeyPoint, Scheme};
use crate::protobuf::quorand::{self as protobuf, dkg_packet::Bundle as ProtoBundle, DkgPacket};

use energon::kyber::dkg::protocol::Bundle;
use energon::kyber::dkg::structs::{
    Deal, DealBundle, Justification, JustificationBundle, Response, ResponseBundle,
};
use energon::traits::{Affine, ScalarField};

#[derive(thiserror::Error, Debug)]
pub enum DkgError {
    #[error("dkg timed out")]
    Timeout,
    #[error("dkg failed: {0}")]
    Failed(String),
    #[error("dkg protocol is not running")]
    NotRunning,
    #[error("received malformed dkg packet")]
    InvalidPacket,
    #[error("this node is not part of the group descriptor")]
    NotInGroup,
    #[error("dkg outcome channel closed unexpectedly")]
    DriverClosed,
}

/// Network plug of the DKG sub-protocol: one way to push a packet to a peer.
/// The daemon implements it over the internal protocol client, which keeps
/// the sub-protocol free of any transport knowledge.
#[tonic::async_trait]
pub trait DkgGateway<S: Scheme>: Send + Sync + 'static {
    async fn send(&self, peer: &Identity<S>, packet: DkgPacket) -> anyhow::Result<()>;
}

/// Converts a sub-protocol bundle into its wire representation.
pub fn bundle_to_proto<S: Scheme>(bundle: Bundle<S>) -> Result<DkgPacket, DkgError> {
    let proto = match bundle {
        Bundle::Deal(d) => {
            let mut commits = Vec::with_capacity(d.public.len());
            for commit in d.public {
                let bytes: Vec<u8> = commit
                    .serialize()
                    .map_err(|_| DkgError::InvalidPacket)?
                    .into();
                commits.push(bytes);
            }

            ProtoBundle::Deal(protobuf::DealBundle {
                dealer_index: d.dealer_index,
                commits,
                deals: d
                    .deals
                    .into_iter()
                    .map(|deal| protobuf::Deal {
                        share_index: deal.share_index,
                        encrypted_share: deal.encrypted_share,
                    })
                    .collect(),
                session_id: d.session_id,
                signature: d.signature,
            })
        }
        Bundle::Response(r) => ProtoBundle::Response(protobuf::ResponseBundle {
            share_index: r.share_index,
            responses: r
                .responses
                .into_iter()
                .map(|resp| protobuf::Response {
                    dealer_index: resp.dealer_index,
                    status: resp.status,
                })
                .collect(),
            session_id: r.session_id,
            signature: r.signature,
        }),
        Bundle::Justification(j) => {
            let mut justifications = Vec::with_capacity(j.justifications.len());
            for justification in j.justifications {
                let share: Vec<u8> = justification
                    .share
                    .to_bytes_be()
                    .map_err(|_| DkgError::InvalidPacket)?
                    .into();
                justifications.push(protobuf::Justification {
                    share_index: justification.share_index,
                    share,
                });
            }

            ProtoBundle::Justification(protobuf::JustificationBundle {
                dealer_index: j.dealer_index,
                justifications,
                session_id: j.session_id,
                signature: j.signature,
            })
        }
    };

    Ok(DkgPacket {
        bundle: Some(proto),
    })
}

/// Converts a wire packet back into a sub-protocol bundle.
pub fn bundle_from_proto<S: Scheme>(packet: DkgPacket) -> Result<Bundle<S>, DkgError> {
    let bundle = match packet.bundle.ok_or(DkgError::InvalidPacket)? {
        ProtoBundle::Deal(d) => Bundle::Deal(DealBundle {
            dealer_index: d.dealer_index,
            public: d
                .commits
                .iter()
                .map(|commit| KeyPoint::<S>::deserialize(commit))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| DkgError::InvalidPacket)?,
            deals: d
                .deals
                .into_iter()
                .map(|deal| Deal {
                    share_index: deal.share_index,
                    encrypted_share: deal.encrypted_share,
                })
                .collect(),
            session_id: d.session_id,
            signature: d.signature,
        }),
        ProtoBundle::Response(r) => Bundle::Response(ResponseBundle {
            share_index: r.share_index,
            responses: r
                .responses
                .into_iter()
                .map(|resp| Response {
                    dealer_index: resp.dealer_index,
                    status: resp.status,
                })
                .collect(),
            session_id: r.session_id,
            signature: r.signature,
        }),
        ProtoBundle::Justification(j) => {
            let mut justifications = Vec::with_capacity(j.justifications.len());
            for justification in j.justifications {
                justifications.push(Justification::<S> {
                    share_index: justification.share_index,
                    share: S::Scalar::from_bytes_be(&justification.share)
                        .map_err(|_| DkgError::InvalidPacket)?,
                });
            }

            Bundle::Justification(JustificationBundle {
                dealer_index: j.dealer_index,
                justifications,
                session_id: j.session_id,
                signature: j.signature,
            })
        }
    };

    Ok(bundle)
}
