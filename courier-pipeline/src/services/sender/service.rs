use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use courier_config::{Config, ConfigError};
use courier_log::LogError;
use courier_protocol::BatchFormat;
use courier_system::{
    AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use url::Url;

use crate::diagnostics::{Diagnostics, MessageId, Severity};
use crate::notifications::{DiscardReason, NotificationManager, SendRequestReason};
use crate::services::buffer::{BufferedPayload, SendBuffer};
use crate::services::sender::backoff::{OFFLINE_BACKOFF_FACTOR, RetryState};
use crate::services::sender::response::{BackendResponse, ResponseClass};
use crate::services::transport::{
    TransportOutcome, TransportRequest, TransportResponse, Transports,
};
use crate::utils::SleepHandle;

/// Appends a serialized envelope to the send buffer.
///
/// If the envelope does not fit into the current batch, the pending batch is sent first.
#[derive(Debug)]
pub struct EnqueuePayload(pub String);

/// Sends all pending payloads regardless of the batch timer.
///
/// The response resolves once no request is in flight anymore.
#[derive(Clone, Copy, Debug)]
pub struct FlushBuffer {
    /// Sends without waiting for the response inside the service.
    pub is_async: bool,
    /// Reported to notification listeners.
    pub reason: SendRequestReason,
}

/// Sends all pending payloads through the teardown transport and waits for all requests.
#[derive(Clone, Copy, Debug)]
pub struct Teardown;

/// Stops sending until [`Resume`] is received. Payloads are still buffered.
#[derive(Clone, Copy, Debug)]
pub struct Pause;

/// Resumes sending after [`Pause`].
#[derive(Clone, Copy, Debug)]
pub struct Resume;

/// Returns a [`SenderSnapshot`].
#[derive(Clone, Copy, Debug)]
pub struct GetSnapshot;

/// Delivery state of the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderState {
    /// Nothing to send.
    Idle,
    /// Payloads wait for the batch timer.
    Batching,
    /// Requests are in flight.
    Sending,
    /// Payloads wait for the retry delay after a failure.
    Backoff,
}

/// Observable state of the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderSnapshot {
    /// The delivery state.
    pub state: SenderState,
    /// Number of payloads not sent yet.
    pub pending: usize,
    /// Number of payloads awaiting a response.
    pub in_flight: usize,
    /// Number of consecutive failed sends.
    pub consecutive_failures: u32,
    /// The current endpoint, updated by redirects.
    pub endpoint: Url,
    /// Number of redirects followed so far.
    pub redirects: u32,
    /// Whether sending is paused.
    pub paused: bool,
}

/// Batches serialized envelopes and delivers them to the collector.
///
/// See the message types for the supported operations.
#[derive(Debug)]
pub enum TelemetrySender {
    /// Appends a payload, see [`EnqueuePayload`].
    Enqueue(EnqueuePayload),
    /// Sends pending payloads, see [`FlushBuffer`].
    Flush(FlushBuffer, Sender<()>),
    /// Final flush, see [`Teardown`].
    Teardown(Teardown, Sender<()>),
    /// See [`Pause`].
    Pause(Pause),
    /// See [`Resume`].
    Resume(Resume),
    /// See [`GetSnapshot`].
    GetSnapshot(GetSnapshot, Sender<SenderSnapshot>),
}

impl Interface for TelemetrySender {}

impl FromMessage<EnqueuePayload> for TelemetrySender {
    type Response = NoResponse;

    fn from_message(message: EnqueuePayload, _: ()) -> Self {
        Self::Enqueue(message)
    }
}

impl FromMessage<FlushBuffer> for TelemetrySender {
    type Response = AsyncResponse<()>;

    fn from_message(message: FlushBuffer, sender: Sender<()>) -> Self {
        Self::Flush(message, sender)
    }
}

impl FromMessage<Teardown> for TelemetrySender {
    type Response = AsyncResponse<()>;

    fn from_message(message: Teardown, sender: Sender<()>) -> Self {
        Self::Teardown(message, sender)
    }
}

impl FromMessage<Pause> for TelemetrySender {
    type Response = NoResponse;

    fn from_message(message: Pause, _: ()) -> Self {
        Self::Pause(message)
    }
}

impl FromMessage<Resume> for TelemetrySender {
    type Response = NoResponse;

    fn from_message(message: Resume, _: ()) -> Self {
        Self::Resume(message)
    }
}

impl FromMessage<GetSnapshot> for TelemetrySender {
    type Response = AsyncResponse<SenderSnapshot>;

    fn from_message(message: GetSnapshot, sender: Sender<SenderSnapshot>) -> Self {
        Self::GetSnapshot(message, sender)
    }
}

/// Sender settings resolved from the [`Config`].
#[derive(Debug)]
struct SenderConfig {
    format: BatchFormat,
    max_batch_size: usize,
    batch_interval: Duration,
    retry_disabled: bool,
    max_redirects: u32,
    custom_headers: Vec<(String, String)>,
}

impl SenderConfig {
    fn new(config: &Config) -> Self {
        Self {
            format: BatchFormat::from_line_delimited(config.line_delimited_json()),
            max_batch_size: config.max_batch_size(),
            batch_interval: config.max_batch_interval(),
            retry_disabled: config.retry_disabled(),
            max_redirects: config.max_redirects(),
            custom_headers: config
                .custom_headers()
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

/// A finished request with the payloads it carried.
struct Completion {
    batch: Vec<BufferedPayload>,
    outcome: TransportOutcome,
}

enum Event {
    Completed(Completion),
    Timer,
    Message(TelemetrySender),
}

/// Service implementing the [`TelemetrySender`] interface.
pub struct TelemetrySenderService {
    config: SenderConfig,
    buffer: SendBuffer,
    transports: Transports,
    retry: RetryState,
    timer: SleepHandle,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    paused: bool,
    endpoint: Url,
    redirects: u32,
    app_id: Option<String>,
    enabled: Arc<AtomicBool>,
    diagnostics: Arc<Diagnostics>,
    notifications: Arc<NotificationManager>,
    flush_waiters: Vec<Sender<()>>,
}

impl TelemetrySenderService {
    /// Creates the service.
    ///
    /// `enabled` is shared with the plugin. While it is unset, failed batches are dropped instead
    /// of retried.
    pub fn new(
        config: &Config,
        buffer: SendBuffer,
        transports: Transports,
        enabled: Arc<AtomicBool>,
        diagnostics: Arc<Diagnostics>,
        notifications: Arc<NotificationManager>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            config: SenderConfig::new(config),
            buffer,
            transports,
            retry: RetryState::default(),
            timer: SleepHandle::idle(),
            in_flight: FuturesUnordered::new(),
            paused: false,
            endpoint: config.endpoint()?,
            redirects: 0,
            app_id: None,
            enabled,
            diagnostics,
            notifications,
            flush_waiters: Vec::new(),
        })
    }

    /// Replaces the retry state, for instance to use a fixed backoff.
    pub fn with_retry(mut self, retry: RetryState) -> Self {
        self.retry = retry;
        self
    }

    async fn handle_message(&mut self, message: TelemetrySender) {
        match message {
            TelemetrySender::Enqueue(EnqueuePayload(payload)) => {
                self.handle_enqueue(payload).await
            }
            TelemetrySender::Flush(flush, sender) => {
                self.trigger_send(flush.is_async, flush.reason, false).await;
                if self.in_flight.is_empty() {
                    sender.send(());
                } else {
                    self.flush_waiters.push(sender);
                }
            }
            TelemetrySender::Teardown(Teardown, sender) => {
                self.trigger_send(false, SendRequestReason::Unload, true)
                    .await;
                while let Some(completion) = self.in_flight.next().await {
                    self.handle_completion(completion);
                }
                sender.send(());
            }
            TelemetrySender::Pause(Pause) => {
                self.paused = true;
                self.timer.reset();
            }
            TelemetrySender::Resume(Resume) => {
                self.paused = false;
                self.arm_timer();
            }
            TelemetrySender::GetSnapshot(GetSnapshot, sender) => sender.send(self.snapshot()),
        }
    }

    async fn handle_enqueue(&mut self, payload: String) {
        let format = self.config.format;
        if self.buffer.pending_len() > 0
            && self.buffer.pending_batch_len_with(format, &payload) > self.config.max_batch_size
        {
            self.trigger_send(true, SendRequestReason::MaxBatchSize, false)
                .await;
        }

        if !self.buffer.enqueue(payload) {
            self.notifications
                .events_discarded(1, DiscardReason::QueueFull);
        }

        self.arm_timer();
    }

    async fn handle_timer(&mut self) {
        let reason = if self.retry.consecutive_failures() > 0 {
            SendRequestReason::Retry
        } else {
            SendRequestReason::NormalSchedule
        };

        self.trigger_send(true, reason, false).await;
    }

    /// Arms the batch timer unless it is already running.
    fn arm_timer(&mut self) {
        if !self.timer.is_idle() || self.paused || self.buffer.pending_len() == 0 {
            return;
        }

        let delay = self.config.batch_interval.max(self.retry.remaining());
        self.timer.set(delay);
    }

    /// Sends a snapshot of all pending payloads.
    ///
    /// Synchronous sends wait for the outcome before returning.
    async fn trigger_send(&mut self, is_async: bool, reason: SendRequestReason, teardown: bool) {
        if self.paused {
            courier_log::debug!(%reason, "sender paused, skipping send");
            return;
        }

        let batch = self.buffer.batch();
        if batch.is_empty() {
            return;
        }

        self.timer.reset();
        self.notifications.events_send_request(reason, is_async);

        let send = self.dispatch(batch, teardown);
        if is_async {
            self.in_flight.push(send);
        } else {
            let completion = send.await;
            self.handle_completion(completion);
        }
    }

    fn dispatch(
        &mut self,
        batch: Vec<BufferedPayload>,
        teardown: bool,
    ) -> BoxFuture<'static, Completion> {
        let format = self.config.format;
        let body = format.join(batch.iter().map(BufferedPayload::as_str));
        let transport = self.transports.select(teardown, body.len()).clone();

        self.buffer.mark_in_flight(&batch);

        courier_log::trace!(
            items = batch.len(),
            bytes = body.len(),
            transport = ?transport.kind(),
            endpoint = %self.endpoint,
            "sending batch"
        );

        let request = TransportRequest {
            url: self.endpoint.clone(),
            headers: self.request_headers(),
            body: Bytes::from(body),
            format,
        };

        let send = transport.send(request);
        Box::pin(async move {
            Completion {
                batch,
                outcome: send.await,
            }
        })
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![(
            "Content-Type".to_owned(),
            self.config.format.content_type().to_owned(),
        )];

        headers.extend(self.config.custom_headers.iter().cloned());

        if let Some(ref app_id) = self.app_id {
            headers.push(("Request-Context".to_owned(), format!("appId={app_id}")));
        }

        headers
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion { batch, outcome } = completion;

        match outcome {
            TransportOutcome::Response(response) => self.handle_response(batch, response),
            TransportOutcome::Queued => {
                self.buffer.acknowledge(&batch);
                self.notifications.events_sent(batch.len());
            }
            TransportOutcome::Failed(error) if error.is_retriable() => {
                courier_log::debug!(
                    error = &error as &dyn Error,
                    items = batch.len(),
                    "failed to send batch"
                );
                let factor = if error.is_offline() {
                    OFFLINE_BACKOFF_FACTOR
                } else {
                    1
                };
                self.resend(&batch, factor);
            }
            TransportOutcome::Failed(error) => {
                self.on_error(&batch, format!("failed to send batch: {}", LogError(&error)));
            }
        }

        self.arm_timer();

        if self.in_flight.is_empty() {
            for waiter in self.flush_waiters.drain(..) {
                waiter.send(());
            }
        }
    }

    fn handle_response(&mut self, batch: Vec<BufferedPayload>, response: TransportResponse) {
        courier_log::trace!(status = response.status, "received response");

        match ResponseClass::from_status(response.status) {
            ResponseClass::Success => self.on_success(&batch, &response.body),
            ResponseClass::PartialSuccess => self.on_partial_success(&batch, &response),
            ResponseClass::Redirect => self.on_redirect(batch, &response),
            ResponseClass::Retriable => self.resend(&batch, 1),
            ResponseClass::Failure => self.on_error(
                &batch,
                format!("collector rejected batch with status {}", response.status),
            ),
        }
    }

    fn on_success(&mut self, batch: &[BufferedPayload], body: &str) {
        let app_id = serde_json::from_str::<BackendResponse>(body)
            .ok()
            .and_then(|response| response.app_id);
        if app_id.is_some() {
            self.app_id = app_id;
        }

        self.retry.reset();
        self.buffer.acknowledge(batch);
        self.notifications.events_sent(batch.len());
    }

    fn on_partial_success(&mut self, batch: &[BufferedPayload], response: &TransportResponse) {
        if self.config.retry_disabled {
            return self.on_error(batch, "partial success and retry is disabled");
        }

        let Some(parsed) = BackendResponse::parse(&response.body) else {
            self.diagnostics.log(
                Severity::Warning,
                MessageId::InvalidBackendResponse,
                "invalid response from collector",
                Some(json!({ "status": response.status })),
                false,
            );
            return self.on_error(batch, "invalid partial success response");
        };

        if parsed.is_full_success() {
            return self.on_success(batch, &response.body);
        }

        let split = parsed.split(batch.len());
        let pick = |indices: &[usize]| -> Vec<BufferedPayload> {
            indices.iter().filter_map(|&i| batch.get(i).cloned()).collect()
        };

        let accepted = pick(&split.accepted);
        if !accepted.is_empty() {
            self.buffer.acknowledge(&accepted);
            self.notifications.events_sent(accepted.len());
        }

        let dropped = pick(&split.dropped);
        if !dropped.is_empty() {
            let message = format!("collector rejected {} items", dropped.len());
            self.on_error(&dropped, message);
        }

        let retry = pick(&split.retry);
        if !retry.is_empty() {
            self.resend(&retry, 1);
        } else if !accepted.is_empty() {
            self.retry.reset();
        }
    }

    fn on_redirect(&mut self, batch: Vec<BufferedPayload>, response: &TransportResponse) {
        let target = response
            .location
            .as_deref()
            .filter(|_| self.redirects < self.config.max_redirects)
            .and_then(|location| self.endpoint.join(location).ok());

        let Some(endpoint) = target else {
            self.diagnostics.log(
                Severity::Warning,
                MessageId::RedirectLimitExceeded,
                "cannot follow redirect",
                Some(json!({
                    "status": response.status,
                    "redirects": self.redirects,
                })),
                false,
            );
            return self.on_error(&batch, "redirect not followed");
        };

        self.redirects += 1;
        courier_log::debug!(%endpoint, redirects = self.redirects, "following redirect");
        self.endpoint = endpoint;

        let send = self.dispatch(batch, false);
        self.in_flight.push(send);
    }

    /// Puts the batch back into the pending set and delays the next send.
    fn resend(&mut self, batch: &[BufferedPayload], linear_factor: u32) {
        if !self.enabled.load(Ordering::Relaxed) {
            let count = self.buffer.clear();
            self.notifications
                .events_discarded(count, DiscardReason::Unknown);
            return;
        }

        if self.config.retry_disabled {
            return self.on_error(batch, "failed to send batch and retry is disabled");
        }

        self.buffer.requeue(batch);
        let delay = self.retry.record_failure(linear_factor);

        self.diagnostics.log(
            Severity::Information,
            MessageId::TransmissionRetried,
            "batch scheduled for retry",
            Some(json!({
                "items": batch.len(),
                "failures": self.retry.consecutive_failures(),
                "delay_ms": delay.as_millis() as u64,
            })),
            false,
        );

        self.timer.set(delay.max(self.config.batch_interval));
    }

    /// Drops the batch for good.
    fn on_error(&mut self, batch: &[BufferedPayload], message: impl Into<String>) {
        self.buffer.acknowledge(batch);
        self.notifications
            .events_discarded(batch.len(), DiscardReason::NonRetryableStatus);
        self.diagnostics.log(
            Severity::Warning,
            MessageId::TransmissionFailed,
            message,
            Some(json!({ "items": batch.len() })),
            false,
        );
    }

    fn snapshot(&self) -> SenderSnapshot {
        let state = if !self.in_flight.is_empty() {
            SenderState::Sending
        } else if self.timer.is_idle() {
            SenderState::Idle
        } else if self.retry.consecutive_failures() > 0 {
            SenderState::Backoff
        } else {
            SenderState::Batching
        };

        SenderSnapshot {
            state,
            pending: self.buffer.pending_len(),
            in_flight: self.buffer.in_flight_len(),
            consecutive_failures: self.retry.consecutive_failures(),
            endpoint: self.endpoint.clone(),
            redirects: self.redirects,
            paused: self.paused,
        }
    }
}

impl Service for TelemetrySenderService {
    type Interface = TelemetrySender;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        courier_log::info!(endpoint = %self.endpoint, "telemetry sender started");

        loop {
            let event = tokio::select! {
                biased;

                Some(completion) = self.in_flight.next() => Event::Completed(completion),
                () = &mut self.timer => Event::Timer,
                message = rx.recv() => match message {
                    Some(message) => Event::Message(message),
                    None => break,
                },
            };

            match event {
                Event::Completed(completion) => self.handle_completion(completion),
                Event::Timer => self.handle_timer().await,
                Event::Message(message) => self.handle_message(message).await,
            }
        }

        while let Some(completion) = self.in_flight.next().await {
            self.handle_completion(completion);
        }

        courier_log::info!(
            pending = self.buffer.pending_len(),
            "telemetry sender stopped"
        );
    }
}
