//! The boundary between the protocol core and whatever carries the bytes.
//!
//! A [`Connector`] produces a [`Link`]: a write endpoint plus a stream of
//! notification buffers. The stream ending, or yielding an error, is the
//! disconnect signal. Dropping the stream unsubscribes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::frame::Frame;

/// Accepts outbound frames.
pub trait WriteEndpoint {
    fn write(&mut self, frame: &Frame) -> impl Future<Output = Result<()>> + Send;
}

/// Opens links to one device. Called again for every reconnect attempt.
pub trait Connector {
    /// Moved into the session's writer task while the link is up.
    type Writer: WriteEndpoint + Send + 'static;

    /// Connect, discover the endpoints and subscribe to notifications.
    ///
    /// Must only return once the notification subscription is active. Callers
    /// bound every call by [`ReconnectPolicy::connect_timeout`] and may drop it
    /// at any await point.
    ///
    /// [`ReconnectPolicy::connect_timeout`]: crate::ReconnectPolicy::connect_timeout
    fn connect(&mut self) -> impl Future<Output = Result<Link<Self::Writer>>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Notification buffers as delivered by the transport, one item per notification.
#[derive(Debug)]
pub struct NotificationStream(mpsc::Receiver<Result<Vec<u8>>>);

impl NotificationStream {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Vec<u8>>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self(rx))
    }
}

impl Stream for NotificationStream {
    type Item = Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.poll_recv(cx)
    }
}

/// One open connection to the BMS.
#[derive(Debug)]
pub struct Link<W> {
    pub writer: W,
    pub notifications: NotificationStream,
}

impl<W> Link<W> {
    pub fn new(writer: W, notifications: NotificationStream) -> Self {
        Self { writer, notifications }
    }
}
