use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header;

use super::{Transport, TransportKind, TransportOutcome, TransportRequest, TransportResponse};

/// Size of the chunks the [`StreamingTransport`] writes.
const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// Creates the HTTP client shared by all transports.
///
/// Redirects are not followed automatically, since the sender handles them with its own budget.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
}

/// Posts a request and waits for the response.
pub async fn execute(
    client: reqwest::Client,
    request: TransportRequest,
    body: reqwest::Body,
) -> TransportOutcome {
    let mut builder = client.post(request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    let response = match builder.body(body).send().await {
        Ok(response) => response,
        Err(error) => return TransportOutcome::Failed(error.into()),
    };

    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = response.text().await.unwrap_or_default();

    TransportOutcome::Response(TransportResponse {
        status,
        body,
        location,
    })
}

/// Sends the body in a single request and reports the response.
#[derive(Clone, Debug)]
pub struct RequestTransport {
    client: reqwest::Client,
}

impl RequestTransport {
    /// Creates the transport with a request timeout.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

impl Transport for RequestTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Request
    }

    fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome> {
        let body = reqwest::Body::from(request.body.clone());
        Box::pin(execute(self.client.clone(), request, body))
    }
}

/// Streams the body in chunks and reports the response.
#[derive(Clone, Debug)]
pub struct StreamingTransport {
    client: reqwest::Client,
}

impl StreamingTransport {
    /// Creates the transport with a request timeout.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

impl Transport for StreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome> {
        let chunks: Vec<Result<Bytes, std::io::Error>> = chunks(&request.body)
            .map(Ok)
            .collect();
        let body = reqwest::Body::wrap_stream(futures::stream::iter(chunks));

        Box::pin(execute(self.client.clone(), request, body))
    }
}

fn chunks(body: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    (0..body.len())
        .step_by(STREAM_CHUNK_SIZE)
        .map(move |start| body.slice(start..(start + STREAM_CHUNK_SIZE).min(body.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks() {
        let body = Bytes::from(vec![b'x'; STREAM_CHUNK_SIZE * 2 + 10]);
        let sizes: Vec<_> = chunks(&body).map(|c| c.len()).collect();
        assert_eq!(sizes, [STREAM_CHUNK_SIZE, STREAM_CHUNK_SIZE, 10]);

        assert_eq!(chunks(&Bytes::new()).count(), 0);
    }
}
