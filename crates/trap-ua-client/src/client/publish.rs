// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Publish loop.
//!
//! One task per channel keeps a Publish request outstanding and forwards
//! every response to the driver, which owns all subscription state.
//! Acknowledgements flow the other way and ride on the next request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{unexpected_response, Channel};
use crate::error::UaError;
use crate::transport::{
    AuthenticationToken, PublishResponse, ServiceRequest, ServiceResponse,
    SubscriptionAcknowledgement,
};
use crate::types::StatusCode;

/// Output of the publish loop.
#[derive(Debug)]
pub(crate) enum PublishEvent {
    /// A response arrived.
    Response { epoch: u64, response: PublishResponse },
    /// Publishing failed; the loop has stopped.
    Failed { epoch: u64, error: UaError },
}

/// Handle of a running publish loop. Dropping it stops the loop.
#[derive(Debug)]
pub(crate) struct PublishLoop {
    epoch: u64,
    acks: mpsc::UnboundedSender<Vec<SubscriptionAcknowledgement>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PublishLoop {
    pub(crate) fn spawn(
        channel: Arc<Channel>,
        token: AuthenticationToken,
        timeout: Duration,
        idle_delay: Duration,
        events: mpsc::UnboundedSender<PublishEvent>,
    ) -> Self {
        let (acks, ack_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let epoch = channel.epoch();
        let task = tokio::spawn(run(
            channel,
            token,
            timeout,
            idle_delay,
            ack_rx,
            events,
            cancel.clone(),
        ));
        Self {
            epoch,
            acks,
            cancel,
            task,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn acknowledge(&self, acks: Vec<SubscriptionAcknowledgement>) {
        if !acks.is_empty() {
            let _ = self.acks.send(acks);
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PublishLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    channel: Arc<Channel>,
    token: AuthenticationToken,
    timeout: Duration,
    idle_delay: Duration,
    mut ack_rx: mpsc::UnboundedReceiver<Vec<SubscriptionAcknowledgement>>,
    events: mpsc::UnboundedSender<PublishEvent>,
    cancel: CancellationToken,
) {
    let epoch = channel.epoch();
    tracing::debug!(epoch, "Publish loop started");

    loop {
        let mut acknowledgements = Vec::new();
        while let Ok(batch) = ack_rx.try_recv() {
            acknowledgements.extend(batch);
        }

        let request = ServiceRequest::Publish { acknowledgements };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = channel.call(Some(token), request, timeout) => result,
        };

        let event = match result {
            Ok(ServiceResponse::Publish(response)) => PublishEvent::Response { epoch, response },
            Ok(_) => PublishEvent::Failed {
                epoch,
                error: unexpected_response("Publish"),
            },
            Err(error) if error.status_code() == Some(StatusCode::BAD_NO_SUBSCRIPTION) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle_delay) => continue,
                }
            }
            Err(error) => PublishEvent::Failed { epoch, error },
        };

        let failed = matches!(event, PublishEvent::Failed { .. });
        if events.send(event).is_err() || failed {
            break;
        }
    }

    tracing::debug!(epoch, "Publish loop stopped");
}
