//! Uploads SSDV packets to an SSDV server.
//!
//! Packets are collected into batches of the configured group size and posted
//! as JSON:
//!
//! ```json
//! {
//!   "type": "packets",
//!   "packets": [
//!     {
//!       "type": "packet",
//!       "packet": "5568...",
//!       "encoding": "hex",
//!       "received": "2024-06-02T10:00:00Z",
//!       "receiver": "DB0XYZ-10"
//!     }
//!   ]
//! }
//! ```
//!
//! A batch the server rejects (4xx) is dropped. Any other failure is retried
//! with the same batch until it succeeds. Batches that fill up in the meantime
//! queue up behind it, so pushing never waits for the server.
//!
//! - [SSDV server API][1]
//!
//! [1]: https://ssdv.habhub.org/

use std::{
    collections::VecDeque,
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Serialize,
    Serializer,
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
    },
    time::Instant,
};

use crate::image::SsdvPacket;

pub const DEFAULT_SERVER: &str = "https://ssdv.habhub.org/api/v0/packets";
pub const RETRY_DELAY: Duration = Duration::from_secs(1);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_QUEUE_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
#[error("forwarder error")]
pub enum Error {
    #[error("reactor dead")]
    ReactorDead,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("server rejected packets with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("delivery failed: {reason}")]
    Transient { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "packet")]
pub struct OutboundPacket {
    /// Hex encoded SSDV packet
    pub packet: String,
    pub encoding: Encoding,
    #[serde(serialize_with = "serialize_received")]
    pub received: DateTime<Utc>,
    pub receiver: String,
}

impl OutboundPacket {
    pub fn new(packet: &SsdvPacket, received: DateTime<Utc>, receiver: impl Into<String>) -> Self {
        Self {
            packet: packet.to_hex(),
            encoding: Encoding::Hex,
            received,
            receiver: receiver.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Hex,
}

fn serialize_received<S: Serializer>(
    received: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&received.format("%Y-%m-%dT%H:%M:%SZ"))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "packets")]
pub struct PacketBatch {
    pub packets: Vec<OutboundPacket>,
}

/// Where batches go.
pub trait Uplink: Send + Sync + 'static {
    fn send(&self, batch: &PacketBatch) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

#[derive(Clone, Debug)]
pub struct HttpUplink {
    client: reqwest::Client,
    url: String,
}

impl HttpUplink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: crate::util::http_client(),
            url: url.into(),
        }
    }
}

impl Uplink for HttpUplink {
    async fn send(&self, batch: &PacketBatch) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(batch)
            .send()
            .await
            .map_err(|error| {
                DeliveryError::Transient {
                    reason: error.to_string(),
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        }
        else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
        else {
            Err(DeliveryError::Transient {
                reason: format!("server responded with {status}"),
            })
        }
    }
}

/// Batches and uploads packets.
///
/// Like the other handles in this crate this is just a command channel to a
/// spawned reactor task, so it's cheap to clone. When the last [`Forwarder`]
/// is dropped, the reactor delivers what's left and terminates.
#[derive(Clone, Debug)]
pub struct Forwarder {
    command_sender: mpsc::Sender<Command>,
}

impl Forwarder {
    pub fn new<U: Uplink>(uplink: U, group_size: usize) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);

        tokio::spawn(async move {
            let reactor = Reactor {
                uplink,
                group_size: group_size.max(1),
                batch: PacketBatch::default(),
                queue: VecDeque::new(),
                retry_at: None,
                enqueued: 0,
                delivered: 0,
                flushes: vec![],
                command_receiver,
            };
            reactor.run().await;
        });

        Self { command_sender }
    }

    async fn send_command(&self, command: Command) -> Result<(), Error> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| Error::ReactorDead)
    }

    pub async fn push(&self, packet: OutboundPacket) -> Result<(), Error> {
        self.send_command(Command::Push(packet)).await
    }

    /// Delivers the pending batch, even if it's not full yet. Returns once it
    /// and all batches queued before it were either accepted or rejected.
    pub async fn flush(&self) -> Result<(), Error> {
        let (done_sender, done_receiver) = oneshot::channel();
        self.send_command(Command::Flush(done_sender)).await?;
        done_receiver.await.map_err(|_| Error::ReactorDead)
    }
}

#[derive(Debug)]
enum Command {
    Push(OutboundPacket),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
struct Reactor<U> {
    uplink: U,
    group_size: usize,
    /// The batch being filled.
    batch: PacketBatch,
    /// Full batches. The front one is being delivered.
    queue: VecDeque<PacketBatch>,
    retry_at: Option<Instant>,
    enqueued: u64,
    delivered: u64,
    /// Flushes waiting until `delivered` reaches their target.
    flushes: Vec<(u64, oneshot::Sender<()>)>,
    command_receiver: mpsc::Receiver<Command>,
}

impl<U: Uplink> Reactor<U> {
    async fn run(mut self) {
        loop {
            if self.retry_at.is_none() && !self.queue.is_empty() {
                self.attempt().await;

                // whatever came in while we were busy
                while let Ok(command) = self.command_receiver.try_recv() {
                    self.handle_command(command);
                }
                continue;
            }

            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = sleep_until_retry(self.retry_at) => {
                    self.retry_at = None;
                }
            }
        }

        // all handles are gone, deliver what's left
        self.enqueue_batch();
        while !self.queue.is_empty() {
            if let Some(retry_at) = self.retry_at.take() {
                tokio::time::sleep_until(retry_at).await;
            }
            self.attempt().await;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Push(packet) => {
                self.batch.packets.push(packet);
                if self.batch.packets.len() >= self.group_size {
                    self.enqueue_batch();
                }
            }
            Command::Flush(done) => {
                self.enqueue_batch();
                self.flushes.push((self.enqueued, done));
                self.notify_flushes();
            }
        }
    }

    fn enqueue_batch(&mut self) {
        if self.batch.packets.is_empty() {
            return;
        }

        self.queue.push_back(std::mem::take(&mut self.batch));
        self.enqueued += 1;

        if self.queue.len() > 1 {
            tracing::debug!(queued = self.queue.len(), "upload pending");
        }
    }

    async fn attempt(&mut self) {
        let Some(batch) = self.queue.front()
        else {
            return;
        };

        match self.uplink.send(batch).await {
            Ok(()) => {
                tracing::info!(packets = batch.packets.len(), "uploaded packets");
                self.finish_front();
            }
            Err(DeliveryError::Rejected { status, body }) => {
                tracing::warn!(status, %body, packets = batch.packets.len(), "server rejected packets, dropping them");
                self.finish_front();
            }
            Err(DeliveryError::Transient { reason }) => {
                tracing::warn!(%reason, queued = self.queue.len(), "upload failed, retrying");
                self.retry_at = Some(Instant::now() + RETRY_DELAY);
            }
        }
    }

    fn finish_front(&mut self) {
        self.queue.pop_front();
        self.delivered += 1;
        self.notify_flushes();
    }

    fn notify_flushes(&mut self) {
        let delivered = self.delivered;
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.flushes)
            .into_iter()
            .partition(|(target, _)| *target <= delivered);
        self.flushes = waiting;

        for (_, done) in done {
            let _ = done.send(());
        }
    }
}

async fn sleep_until_retry(retry_at: Option<Instant>) {
    match retry_at {
        Some(retry_at) => tokio::time::sleep_until(retry_at).await,
        None => std::future::pending().await,
    }
}
