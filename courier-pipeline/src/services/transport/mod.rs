//! Delivery of request bodies to the collector.
//!
//! A [`Transport`] sends one request body and reports a [`TransportOutcome`]. Three strategies
//! exist: a fire-and-forget transport that cannot observe the response, a request transport and
//! a streaming transport. One of them is chosen at startup by [`select_transport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_config::Config;
use courier_protocol::BatchFormat;
use futures::future::BoxFuture;
use url::Url;

mod fire_and_forget;
mod http;

pub use self::fire_and_forget::*;
pub use self::http::*;

/// The delivery strategy of a [`Transport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Hands the body off and never observes a response.
    FireAndForget,
    /// Sends the body in a single request and reports the response.
    Request,
    /// Streams the body in chunks and reports the response.
    Streaming,
}

/// A request to the collector.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// The endpoint to post to.
    pub url: Url,
    /// Headers in the order they are sent, including the content type.
    pub headers: Vec<(String, String)>,
    /// The joined batch.
    pub body: Bytes,
    /// The format of the body.
    pub format: BatchFormat,
}

/// A response of the collector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The response body, empty if it could not be read.
    pub body: String,
    /// The `Location` header of redirects.
    pub location: Option<String>,
}

impl TransportResponse {
    /// Creates a response with an empty body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// An error delivering a request.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP client failed.
    #[error("could not send request")]
    Reqwest(#[from] reqwest::Error),
    /// The network is not reachable.
    #[error("network is offline")]
    Offline,
    /// The body exceeds what the transport can deliver.
    #[error("payload of {0} bytes exceeds the transport limit")]
    PayloadTooLarge(usize),
    /// None of the transports is supported in this environment.
    #[error("no supported transport available")]
    Unavailable,
}

impl TransportError {
    /// Returns `true` if the error indicates a network outage rather than a rejected request.
    pub fn is_offline(&self) -> bool {
        match self {
            Self::Reqwest(error) => error.is_connect() || error.is_timeout(),
            Self::Offline => true,
            Self::PayloadTooLarge(_) | Self::Unavailable => false,
        }
    }

    /// Returns `true` if sending the same request again may succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::PayloadTooLarge(_) | Self::Unavailable)
    }
}

/// The result of sending a request.
#[derive(Debug)]
pub enum TransportOutcome {
    /// The collector responded.
    Response(TransportResponse),
    /// The body was handed off without a way to observe delivery.
    Queued,
    /// The request could not be delivered.
    Failed(TransportError),
}

/// A strategy to deliver request bodies.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Returns the delivery strategy.
    fn kind(&self) -> TransportKind;

    /// Returns the largest body this transport can deliver, if limited.
    fn max_payload_size(&self) -> Option<usize> {
        None
    }

    /// Sends a request.
    ///
    /// The returned future resolves with the outcome. Dropping it before completion may abort the
    /// request, except for transports that hand the body off immediately.
    fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome>;
}

/// The transports available in the current environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportSupport {
    /// Detached sends are possible.
    pub fire_and_forget: bool,
    /// Request and response round trips are possible.
    pub request: bool,
    /// Streaming request bodies are possible.
    pub streaming: bool,
}

impl TransportSupport {
    /// Detects the supported transports.
    ///
    /// All strategies are built on the HTTP client and a tokio runtime, so availability only
    /// depends on running inside a runtime.
    pub fn detect() -> Self {
        let runtime = tokio::runtime::Handle::try_current().is_ok();
        Self {
            fire_and_forget: runtime,
            request: runtime,
            streaming: runtime,
        }
    }
}

/// Chooses the transport strategy. The first match wins.
///
/// The fire-and-forget transport is preferred unless it is disabled, followed by the request
/// transport and finally the streaming transport.
pub fn select_transport(
    support: TransportSupport,
    disable_fire_and_forget: bool,
) -> Option<TransportKind> {
    if support.fire_and_forget && !disable_fire_and_forget {
        Some(TransportKind::FireAndForget)
    } else if support.request {
        Some(TransportKind::Request)
    } else if support.streaming {
        Some(TransportKind::Streaming)
    } else {
        None
    }
}

/// The transports used by a sender.
///
/// Regular sends use the primary transport, teardown sends the teardown transport. Bodies larger
/// than the chosen transport accepts go through the fallback transport.
#[derive(Clone, Debug)]
pub struct Transports {
    primary: Arc<dyn Transport>,
    teardown: Arc<dyn Transport>,
    fallback: Arc<dyn Transport>,
}

impl Transports {
    /// Uses a single transport for all sends.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            teardown: transport.clone(),
            fallback: transport.clone(),
            primary: transport,
        }
    }

    /// Sets the transport for teardown sends.
    pub fn with_teardown(mut self, transport: Arc<dyn Transport>) -> Self {
        self.teardown = transport;
        self
    }

    /// Sets the transport for oversized bodies.
    pub fn with_fallback(mut self, transport: Arc<dyn Transport>) -> Self {
        self.fallback = transport;
        self
    }

    /// Builds the transports from configuration.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        Self::from_support(TransportSupport::detect(), config)
    }

    /// Builds the transports for the given support.
    pub fn from_support(support: TransportSupport, config: &Config) -> Result<Self, TransportError> {
        let timeout = config.http_timeout();
        let primary_kind = select_transport(support, config.fire_and_forget_disabled())
            .ok_or(TransportError::Unavailable)?;

        let primary = build_transport(primary_kind, timeout)?;
        let fallback = match select_transport(support, true) {
            Some(kind) => build_transport(kind, timeout)?,
            None => primary.clone(),
        };
        let teardown = match select_transport(support, config.teardown_fire_and_forget_disabled()) {
            Some(kind) if kind != primary_kind => build_transport(kind, timeout)?,
            _ => primary.clone(),
        };

        courier_log::debug!(
            primary = ?primary.kind(),
            teardown = ?teardown.kind(),
            "selected transports"
        );

        Ok(Self {
            primary,
            teardown,
            fallback,
        })
    }

    /// Returns the transport for a body of `body_len` bytes.
    pub fn select(&self, teardown: bool, body_len: usize) -> &Arc<dyn Transport> {
        let transport = if teardown {
            &self.teardown
        } else {
            &self.primary
        };

        match transport.max_payload_size() {
            Some(max) if body_len > max => &self.fallback,
            _ => transport,
        }
    }

    /// Returns the kind of the primary transport.
    pub fn primary_kind(&self) -> TransportKind {
        self.primary.kind()
    }

    /// Returns the kind of the teardown transport.
    pub fn teardown_kind(&self) -> TransportKind {
        self.teardown.kind()
    }
}

fn build_transport(
    kind: TransportKind,
    timeout: Duration,
) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(match kind {
        TransportKind::FireAndForget => Arc::new(FireAndForgetTransport::new(timeout)?),
        TransportKind::Request => Arc::new(RequestTransport::new(timeout)?),
        TransportKind::Streaming => Arc::new(StreamingTransport::new(timeout)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: TransportSupport = TransportSupport {
        fire_and_forget: true,
        request: true,
        streaming: true,
    };

    #[test]
    fn test_selection_order() {
        assert_eq!(
            select_transport(ALL, false),
            Some(TransportKind::FireAndForget)
        );
        assert_eq!(select_transport(ALL, true), Some(TransportKind::Request));

        let streaming_only = TransportSupport {
            fire_and_forget: false,
            request: false,
            streaming: true,
        };
        assert_eq!(
            select_transport(streaming_only, false),
            Some(TransportKind::Streaming)
        );

        let none = TransportSupport {
            fire_and_forget: false,
            request: false,
            streaming: false,
        };
        assert_eq!(select_transport(none, false), None);
    }

    #[tokio::test]
    async fn test_from_default_config() {
        let config = Config::default();
        let transports = Transports::from_support(ALL, &config).unwrap();

        assert_eq!(transports.primary_kind(), TransportKind::Request);
        assert_eq!(transports.teardown_kind(), TransportKind::FireAndForget);

        let large = FIRE_AND_FORGET_MAX_PAYLOAD_SIZE + 1;
        assert_eq!(
            transports.select(true, large).kind(),
            TransportKind::Request
        );
        assert_eq!(
            transports.select(true, 10).kind(),
            TransportKind::FireAndForget
        );
    }

    #[test]
    fn test_no_transport_is_fatal() {
        let none = TransportSupport {
            fire_and_forget: false,
            request: false,
            streaming: false,
        };

        assert!(matches!(
            Transports::from_support(none, &Config::default()),
            Err(TransportError::Unavailable)
        ));
    }
}
