//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Peer connection adapter over `webrtc::RTCPeerConnection`.

use std::sync::Arc;

use webrtc::{
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
};

use crate::{
    common::Result,
    webrtc::{
        data_channel::{DataChannel, DataChannelInit},
        ice_candidate::IceCandidate,
        native::data_channel::NativeDataChannel,
        peer_connection::{
            BoxedCompletionHandler, BoxedDescriptionHandler, ConnectionState, PeerConnection,
            SdpType, SessionDescription,
        },
        peer_connection_observer::PeerConnectionObserver,
    },
};

pub struct NativePeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
    runtime: tokio::runtime::Handle,
}

impl NativePeerConnection {
    pub(super) fn new(
        peer_connection: Arc<RTCPeerConnection>,
        runtime: tokio::runtime::Handle,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Self {
        let observer_for_candidates = observer.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // The end-of-gathering sentinel is not surfaced.
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => observer_for_candidates.handle_ice_candidate(IceCandidate::new(
                        init.candidate,
                        init.sdp_mid,
                        init.sdp_mline_index,
                    )),
                    Err(err) => warn!("native: unable to serialize candidate: {}", err),
                }
            }
            Box::pin(async {})
        }));

        let observer_for_state = observer.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                observer_for_state.handle_connection_state_changed(map_connection_state(state));
                Box::pin(async {})
            },
        ));

        let observer_for_channels = observer;
        let runtime_for_channels = runtime.clone();
        peer_connection.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
            let wrapped = NativeDataChannel::new(data_channel, runtime_for_channels.clone());
            observer_for_channels.handle_data_channel(Arc::new(wrapped));
            Box::pin(async {})
        }));

        Self {
            peer_connection,
            runtime,
        }
    }
}

impl PeerConnection for NativePeerConnection {
    fn create_offer(&self, done: BoxedDescriptionHandler) {
        let peer_connection = self.peer_connection.clone();
        self.runtime.spawn(async move {
            let result = match peer_connection.create_offer(None).await {
                Ok(offer) => Ok(SessionDescription::offer(offer.sdp)),
                Err(err) => Err(err.into()),
            };
            done(result);
        });
    }

    fn create_answer(&self, done: BoxedDescriptionHandler) {
        let peer_connection = self.peer_connection.clone();
        self.runtime.spawn(async move {
            let result = match peer_connection.create_answer(None).await {
                Ok(answer) => Ok(SessionDescription::answer(answer.sdp)),
                Err(err) => Err(err.into()),
            };
            done(result);
        });
    }

    fn set_local_description(&self, description: SessionDescription, done: BoxedCompletionHandler) {
        let peer_connection = self.peer_connection.clone();
        self.runtime.spawn(async move {
            let result = async {
                let description = to_native_description(&description)?;
                peer_connection.set_local_description(description).await?;
                Ok(())
            }
            .await;
            done(result);
        });
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
        done: BoxedCompletionHandler,
    ) {
        let peer_connection = self.peer_connection.clone();
        self.runtime.spawn(async move {
            let result = async {
                let description = to_native_description(&description)?;
                peer_connection.set_remote_description(description).await?;
                Ok(())
            }
            .await;
            done(result);
        });
    }

    fn add_ice_candidate(&self, candidate: IceCandidate, done: BoxedCompletionHandler) {
        let peer_connection = self.peer_connection.clone();
        self.runtime.spawn(async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            };
            done(
                peer_connection
                    .add_ice_candidate(init)
                    .await
                    .map_err(Into::into),
            );
        });
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        let peer_connection = self.peer_connection.clone();
        let label = label.to_string();
        let data_channel = self.runtime.block_on(async move {
            peer_connection
                .create_data_channel(
                    &label,
                    Some(RTCDataChannelInit {
                        ordered: Some(init.ordered),
                        max_retransmits: init.max_retransmits,
                        ..Default::default()
                    }),
                )
                .await
        })?;
        Ok(Arc::new(NativeDataChannel::new(
            data_channel,
            self.runtime.clone(),
        )))
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let peer_connection = self.peer_connection.clone();
        self.runtime
            .block_on(async move { peer_connection.local_description().await })
            .and_then(|description| {
                let sdp_type = match description.sdp_type {
                    RTCSdpType::Offer => SdpType::Offer,
                    RTCSdpType::Answer => SdpType::Answer,
                    _ => return None,
                };
                Some(SessionDescription {
                    sdp_type,
                    sdp: description.sdp,
                })
            })
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.peer_connection.connection_state())
    }

    fn close(&self) {
        let peer_connection = self.peer_connection.clone();
        self.runtime.spawn(async move {
            if let Err(err) = peer_connection.close().await {
                warn!("native: close failed: {}", err);
            }
        });
    }
}

fn to_native_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let native = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone())?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone())?,
    };
    Ok(native)
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => ConnectionState::New,
    }
}
