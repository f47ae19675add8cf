use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, each message carrying the
/// response sender created by [`FromMessage::from_message`].
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// Response behavior of an [`Interface`] message.
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request when sending an asynchronous message to a service.
///
/// Resolves once the service answers, or with [`SendError`] if the service drops the message.
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|r| r.map_err(|_| SendError))
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("open", &!self.0.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    ///
    /// The value is dropped silently if the recipient is no longer waiting.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

/// Message response resulting in an asynchronous [`Request`].
pub struct AsyncResponse<T>(PhantomData<T>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

impl<T: Send> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Message response for fire-and-forget messages.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Declares a message as part of an [`Interface`].
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [`Service`].
///
/// The address allows to [send](Self::send) messages to the service as long as the service is
/// running. It can be freely cloned.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("open", &!self.tx.is_closed())
            .finish()
    }
}

// Manually derive clone since we do not require `I: Clone` and the Clone derive adds this
// constraint.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// Sending never blocks. Depending on the message's response behavior, this returns a
    /// future to await the response or nothing. The message is delivered and handled
    /// regardless of whether the response is awaited. If the service has shut down, the message
    /// is dropped and asynchronous requests resolve to [`SendError`].
    pub fn send<M>(&self, message: M) -> <I::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = I::Response::channel();
        if self.tx.send(I::from_message(message, tx)).is_err() {
            courier_log::debug!(
                service = std::any::type_name::<I>(),
                "message dropped, service has shut down"
            );
        }
        rx
    }

    /// Returns `true` if the service is no longer receiving messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Custom address used for testing.
    ///
    /// Returns the receiving end of the channel for inspection.
    pub fn custom() -> (Self, mpsc::UnboundedReceiver<I>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Addr { tx }, rx)
    }
}

/// Inbox of a service.
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next message.
    ///
    /// Returns `None` once all addresses have been dropped and the inbox is drained.
    pub async fn recv(&mut self) -> Option<I> {
        self.rx.recv().await
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &std::any::type_name::<I>())
            .finish()
    }
}

/// Creates an unbounded channel for communicating with a [`Service`].
pub fn channel<I: Interface>() -> (Addr<I>, Receiver<I>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Addr { tx }, Receiver { rx })
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages through their [`Interface`] and handle them one by one on their own
/// task. They own their state exclusively, so no locking is required inside the service.
pub trait Service: Sized {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Runs the service until the inbox is closed.
    fn run(self, rx: Receiver<Self::Interface>) -> impl Future<Output = ()> + Send + 'static;

    /// Starts the service on the current tokio runtime and returns its address.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    fn start_detached(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel();
        self.spawn_handler(rx);
        addr
    }

    /// Spawns the service on the current tokio runtime with the given inbox.
    fn spawn_handler(self, rx: Receiver<Self::Interface>) {
        tokio::spawn(self.run(rx));
    }

    /// Returns a unique name for this service implementation.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}
