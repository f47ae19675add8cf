use std::time::Duration;

use futures::future::{self, BoxFuture};

use super::http::{build_client, execute};
use super::{Transport, TransportError, TransportKind, TransportOutcome, TransportRequest};

/// Largest body the [`FireAndForgetTransport`] accepts.
pub const FIRE_AND_FORGET_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Hands bodies to a detached task without observing the response.
///
/// Sends complete with [`TransportOutcome::Queued`] as soon as the request was handed off, which
/// makes this transport suitable for shutdown where responses may never arrive.
#[derive(Clone, Debug)]
pub struct FireAndForgetTransport {
    client: reqwest::Client,
}

impl FireAndForgetTransport {
    /// Creates the transport with a request timeout.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

impl Transport for FireAndForgetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::FireAndForget
    }

    fn max_payload_size(&self) -> Option<usize> {
        Some(FIRE_AND_FORGET_MAX_PAYLOAD_SIZE)
    }

    fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome> {
        let size = request.body.len();
        if size > FIRE_AND_FORGET_MAX_PAYLOAD_SIZE {
            let error = TransportError::PayloadTooLarge(size);
            return Box::pin(future::ready(TransportOutcome::Failed(error)));
        }

        let body = reqwest::Body::from(request.body.clone());
        let task = execute(self.client.clone(), request, body);

        tokio::spawn(async move {
            match task.await {
                TransportOutcome::Response(response) => {
                    courier_log::trace!(status = response.status, "detached request completed");
                }
                TransportOutcome::Failed(error) => {
                    courier_log::debug!(
                        error = &error as &dyn std::error::Error,
                        "detached request failed"
                    );
                }
                TransportOutcome::Queued => {}
            }
        });

        Box::pin(future::ready(TransportOutcome::Queued))
    }
}
