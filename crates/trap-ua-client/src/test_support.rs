// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Scripted transport for unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{Channel, SecureChannelManager};
use crate::config::ClientConfig;
use crate::error::UaResult;
use crate::transport::{
    HelloParameters, OpenSecureChannelRequest, RequestHeader, SecureChannelToken, ServiceRequest,
    ServiceResponse, TransportConnection, TransportEvent, UaTransport, PROTOCOL_VERSION,
};
use crate::types::EndpointUrl;

/// Answers service requests.
pub(crate) type Script = Arc<dyn Fn(ServiceRequest) -> UaResult<ServiceResponse> + Send + Sync>;

struct ScriptedConnection {
    script: Script,
}

#[async_trait]
impl TransportConnection for ScriptedConnection {
    fn protocol_version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    async fn open_secure_channel(&self, request: OpenSecureChannelRequest) -> UaResult<SecureChannelToken> {
        Ok(SecureChannelToken {
            channel_id: 1,
            token_id: 1,
            revised_lifetime: request.requested_lifetime,
        })
    }

    async fn send(&self, _header: RequestHeader, request: ServiceRequest) -> UaResult<ServiceResponse> {
        (self.script)(request)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        None
    }

    async fn close(&self) {}
}

struct ScriptedTransport {
    script: Script,
}

#[async_trait]
impl UaTransport for ScriptedTransport {
    async fn connect(
        &self,
        _endpoint: &EndpointUrl,
        _hello: &HelloParameters,
    ) -> UaResult<Arc<dyn TransportConnection>> {
        Ok(Arc::new(ScriptedConnection {
            script: Arc::clone(&self.script),
        }))
    }
}

/// Opens a channel whose requests are answered by `script`.
pub(crate) async fn open_scripted_channel(script: Script) -> (SecureChannelManager, Arc<Channel>) {
    let config = ClientConfig::new("opc.tcp://localhost:4840");
    let (mut manager, _losses) = SecureChannelManager::new(&config, Arc::new(ScriptedTransport { script }));
    let endpoint = EndpointUrl::parse(&config.endpoint).expect("valid endpoint");
    let channel = manager
        .open(&endpoint, Duration::from_secs(1))
        .await
        .expect("scripted channel opens");
    (manager, channel)
}
