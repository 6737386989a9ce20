//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Factory over the `webrtc` crate. Owns a small tokio runtime that
//! drives the crate's async API; the capability surface stays
//! callback-based.

use std::sync::Arc;

use webrtc::{
    api::{interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder, API},
    ice_transport::ice_server::RTCIceServer,
    interceptor::registry::Registry,
    peer_connection::configuration::RTCConfiguration,
};

use crate::{
    common::Result,
    webrtc::{
        native::peer_connection::NativePeerConnection,
        peer_connection::PeerConnection,
        peer_connection_factory::{PeerConnectionFactory, RtcConfig},
        peer_connection_observer::PeerConnectionObserver,
    },
};

pub struct NativePeerConnectionFactory {
    api: Arc<API>,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl NativePeerConnectionFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("webrtc-native")
            .enable_all()
            .build()?;
        Ok(Self {
            api: Arc::new(api),
            runtime: Arc::new(runtime),
        })
    }
}

impl PeerConnectionFactory for NativePeerConnectionFactory {
    fn create_peer_connection(
        &self,
        config: &RtcConfig,
        observer: Box<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let api = self.api.clone();
        let peer_connection = self
            .runtime
            .block_on(async move { api.new_peer_connection(rtc_config).await })?;
        Ok(Arc::new(NativePeerConnection::new(
            Arc::new(peer_connection),
            self.runtime.handle().clone(),
            observer.into(),
        )))
    }
}
