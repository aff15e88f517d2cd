#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use dalyread::frame::{Frame, PAYLOAD_LEN};
use dalyread::{BmsError, Connector, Link, NotificationStream, Result, WriteEndpoint};
use tokio::sync::mpsc;

pub type NotificationSender = mpsc::Sender<Result<Vec<u8>>>;

/// A response frame as the BMS sends it, addressed from the BMS (0x01).
pub fn response(command: u8, payload: &str) -> Frame {
    let payload: [u8; PAYLOAD_LEN] = hex::decode(payload).unwrap().try_into().unwrap();
    Frame::with_payload(0x01, command, payload)
}

pub fn concat(frames: &[Frame]) -> Vec<u8> {
    frames.iter().flat_map(|f| f.as_bytes().iter().copied()).collect()
}

pub const SOC: &str = "02100000751c02fd";
pub const TEMPERATURE: &str = "3e022a0100000000";
pub const MOSFET: &str = "0101011200030d40";
pub const PACK: &str = "0403010000000500";

#[derive(Debug, Clone, Default)]
pub struct MockWriter {
    pub written: Arc<Mutex<Vec<Frame>>>,
    pub fail: Arc<AtomicBool>,
    pub hang: Arc<AtomicBool>,
}

impl MockWriter {
    pub fn commands(&self) -> Vec<u8> {
        self.written.lock().unwrap().iter().map(|f| f.command()).collect()
    }
}

impl WriteEndpoint for MockWriter {
    async fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BmsError::TransportWrite("mock write failure".to_string()));
        }
        self.written.lock().unwrap().push(*frame);
        Ok(())
    }
}

/// Connects according to a script of outcomes; once the script runs out every attempt fails.
/// While `hang` is set an attempt is counted but never finishes.
///
/// The notification sender of every successful link is kept in `links`. Clearing it
/// ends the link's notification stream, which the client sees as a disconnect.
#[derive(Debug, Clone)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<bool>>>,
    pub attempts: Arc<AtomicU32>,
    pub disconnects: Arc<AtomicU32>,
    pub links: Arc<Mutex<Vec<NotificationSender>>>,
    pub writer: MockWriter,
    pub hang: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn new(script: &[bool]) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.iter().copied().collect())),
            attempts: Arc::new(AtomicU32::new(0)),
            disconnects: Arc::new(AtomicU32::new(0)),
            links: Arc::new(Mutex::new(Vec::new())),
            writer: MockWriter::default(),
            hang: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sender(&self) -> NotificationSender {
        self.links.lock().unwrap().last().cloned().expect("no open link")
    }

    /// Drop every open link.
    pub fn drop_links(&self) {
        self.links.lock().unwrap().clear();
    }
}

impl Connector for MockConnector {
    type Writer = MockWriter;

    async fn connect(&mut self) -> Result<Link<MockWriter>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let succeed = self.script.lock().unwrap().pop_front().unwrap_or(false);
        if !succeed {
            return Err(BmsError::ConnectFailure("mock: device not found".to_string()));
        }
        let (tx, notifications) = NotificationStream::channel(16);
        self.links.lock().unwrap().push(tx);
        Ok(Link::new(self.writer.clone(), notifications))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.drop_links();
        Ok(())
    }
}
