//! Turns notification buffers into published telemetry and commands into written frames.
//!
//! Requests and responses are not correlated by anything but the command byte: a
//! response is published as soon as it arrives, whichever request caused it. Two
//! outstanding requests for the same command cannot be told apart.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{BmsError, Result};
use crate::event_bus::EventBus;
use crate::frame::{self, encode_command, Frame};
use crate::telemetry::TelemetryEvent;
use crate::transport::{Link, WriteEndpoint};

/// What happened to one notification buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Whole frames found in the buffer
    pub frames: usize,
    /// Events handed to the bus
    pub published: usize,
    /// Valid frames of known commands that have no decoder
    pub skipped: usize,
    /// Frames dropped because of a bad checksum, an unknown command or an invalid value
    pub rejected: usize,
    /// Bytes after the last whole frame, discarded
    pub trailing: usize,
}

/// Decode every whole frame of a notification buffer, independently of each other.
///
/// A frame with a bad checksum is discarded, never decoded.
pub fn decode_notification(buffer: &[u8]) -> (Vec<Result<Option<TelemetryEvent>>>, usize) {
    let (frames, trailing) = frame::split(buffer);
    let results = frames
        .map(|frame| {
            frame.verify()?;
            TelemetryEvent::from_frame(&frame)
        })
        .collect();
    (results, trailing)
}

/// Commands waiting for the writer task. Issuing into a full queue fails.
const WRITE_QUEUE: usize = 16;

/// Publishes decoded notifications and queues command writes.
///
/// Writes run on their own task so a slow or stuck write never holds up
/// notification handling. Their failures come back through
/// [`write_failure`](Self::write_failure).
#[derive(Debug)]
pub struct ProtocolSession {
    outbound: Option<Outbound>,
    failures: mpsc::UnboundedReceiver<BmsError>,
    failure_tx: mpsc::UnboundedSender<BmsError>,
    bus: EventBus,
    write_timeout: Duration,
}

#[derive(Debug)]
struct Outbound {
    frames: mpsc::Sender<Frame>,
    task: JoinHandle<()>,
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ProtocolSession {
    pub fn new(bus: EventBus, write_timeout: Duration) -> Self {
        let (failure_tx, failures) = mpsc::unbounded_channel();
        Self {
            outbound: None,
            failures,
            failure_tx,
            bus,
            write_timeout,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    /// Hand the write endpoint of a link whose notification subscription is active
    /// to a new writer task. Must be called within a tokio runtime.
    pub fn start<W>(&mut self, writer: W)
    where
        W: WriteEndpoint + Send + 'static,
    {
        let (frames, queue) = mpsc::channel(WRITE_QUEUE);
        let task = tokio::spawn(write_frames(
            writer,
            queue,
            self.failure_tx.clone(),
            self.write_timeout,
        ));
        self.outbound = Some(Outbound { frames, task });
    }

    /// Detach from the link. Queued and in-flight writes are abandoned.
    /// Returns false if the session was not started.
    pub fn stop(&mut self) -> bool {
        self.outbound.take().is_some()
    }

    pub fn is_started(&self) -> bool {
        self.outbound.is_some()
    }

    /// Decode a notification buffer and publish every event it holds, in frame order.
    pub fn on_notification(&mut self, buffer: &[u8]) -> Dispatch {
        if !self.is_started() {
            tracing::debug!(len = buffer.len(), "notification before subscription, dropped");
            return Dispatch::default();
        }
        tracing::debug!(rx = %hex::encode(buffer), "notification");

        let (results, trailing) = decode_notification(buffer);
        let mut dispatch = Dispatch {
            frames: results.len(),
            trailing,
            ..Dispatch::default()
        };
        if trailing > 0 {
            tracing::debug!(trailing, "discarding partial frame");
        }

        for result in results {
            match result {
                Ok(Some(event)) => {
                    self.bus.publish(&event);
                    dispatch.published += 1;
                }
                Ok(None) => dispatch.skipped += 1,
                Err(err) => {
                    tracing::warn!(%err, "frame rejected");
                    self.bus.report(&err);
                    dispatch.rejected += 1;
                }
            }
        }
        dispatch
    }

    /// Queue a read request for `command`. Returns without waiting for the write
    /// or the response.
    pub fn issue(&mut self, command: u8) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(BmsError::NotStarted)?;
        let frame = encode_command(command);
        outbound.frames.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => BmsError::TransportWrite(format!(
                "write queue full, command 0x{command:02x} dropped"
            )),
            TrySendError::Closed(_) => BmsError::TransportWrite("writer task ended".to_string()),
        })
    }

    /// The next write that failed or timed out. Cancel safe.
    pub async fn write_failure(&mut self) -> Option<BmsError> {
        self.failures.recv().await
    }
}

async fn write_frames<W: WriteEndpoint>(
    mut writer: W,
    mut queue: mpsc::Receiver<Frame>,
    failures: mpsc::UnboundedSender<BmsError>,
    write_timeout: Duration,
) {
    while let Some(frame) = queue.recv().await {
        tracing::debug!(tx = %hex::encode(frame), "write");
        let outcome = match timeout(write_timeout, writer.write(&frame)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BmsError::TransportWrite(format!(
                "write of command 0x{:02x} timed out",
                frame.command()
            ))),
        };
        if let Err(err) = outcome {
            if failures.send(err).is_err() {
                break;
            }
        }
    }
}

/// Write one command on a link and decode the next notification.
///
/// Fails if no notification arrives in time, or if the one that does holds no
/// telemetry. Invalid frames in the response are dropped.
pub async fn query<W: WriteEndpoint>(
    link: &mut Link<W>,
    command: u8,
    response_timeout: Duration,
) -> Result<Vec<TelemetryEvent>> {
    let frame = encode_command(command);
    tracing::debug!(tx = %hex::encode(frame), "query");
    timeout(response_timeout, link.writer.write(&frame))
        .await
        .map_err(|_| BmsError::Timeout("command write"))??;

    let buffer = match timeout(response_timeout, link.notifications.next()).await {
        Err(_) => return Err(BmsError::Timeout("response notification")),
        Ok(None) => {
            return Err(BmsError::UnexpectedDisconnect(
                "end of notification stream".to_string(),
            ))
        }
        Ok(Some(buffer)) => buffer?,
    };
    tracing::debug!(rx = %hex::encode(&buffer), "response");

    let (results, _) = decode_notification(&buffer);
    let events: Vec<TelemetryEvent> = results
        .into_iter()
        .filter_map(|result| match result {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(%err, "frame rejected");
                None
            }
        })
        .collect();

    if events.is_empty() {
        return Err(BmsError::EmptyResponse(command));
    }
    Ok(events)
}
