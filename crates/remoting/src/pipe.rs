//! Byte streams across a channel
//!
//! A [`Pipe`] is created on one side with the direction of the data, sent to
//! the peer as part of a request, and connected when the peer decodes it.
//! Each end registers a slot in the pipe table of its channel; the decoding
//! side announces its slot with a connect notice so both ends can address
//! each other. With pipe flow control negotiated the writer holds a credit
//! window that the reader replenishes as it drains data.

use crate::current;
use crate::Channel;
use bytes::Bytes;
use parking_lot::Mutex;
use remoting_proto::{Command, PipeId};
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::debug;

const CHUNK_SIZE: usize = 8 * 1024;

/// Default credit window of a pipe writer
pub const DEFAULT_PIPE_WINDOW: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Direction {
    /// Written remotely, read locally
    RemoteToLocal,
    /// Written locally, read remotely
    LocalToRemote,
}

#[derive(Serialize, Deserialize)]
struct WirePipe {
    direction: Direction,
    id: PipeId,
}

pub(crate) enum PipeEvent {
    Connected {
        channel: Channel,
        local: PipeId,
        peer: PipeId,
    },
    Data(Bytes),
    Eof,
    Aborted(String),
}

#[derive(Clone)]
enum Link {
    Pending,
    Connected { channel: Channel, target: PipeId },
    Dead(String),
}

struct WriterShared {
    link: watch::Sender<Link>,
    window: Semaphore,
    local: Mutex<Option<PipeId>>,
    eof_on_connect: AtomicBool,
}

impl WriterShared {
    fn new() -> Arc<Self> {
        let (link, _) = watch::channel(Link::Pending);
        Arc::new(Self {
            link,
            window: Semaphore::new(0),
            local: Mutex::new(None),
            eof_on_connect: AtomicBool::new(false),
        })
    }

    fn connect(&self, channel: &Channel, target: PipeId) {
        self.window.add_permits(channel.inner().config.pipe_window);
        self.link.send_replace(Link::Connected {
            channel: channel.clone(),
            target,
        });
        if self.eof_on_connect.swap(false, Ordering::SeqCst) {
            self.finish(channel, target);
        }
    }

    fn acknowledge(&self, size: u32) {
        self.window.add_permits(size as usize);
    }

    fn kill(&self, cause: String) {
        self.link.send_replace(Link::Dead(cause));
        self.window.close();
    }

    fn finish(&self, channel: &Channel, target: PipeId) {
        let _ = channel.send(Command::PipeEof { target });
        if let Some(local) = self.local.lock().take() {
            channel.inner().pipes.remove(local);
        }
    }
}

enum Slot {
    Reader {
        tx: mpsc::UnboundedSender<PipeEvent>,
        peer: Option<PipeId>,
    },
    Writer(Arc<WriterShared>),
}

/// Local ends of every pipe connected over a channel
pub(crate) struct PipeTable {
    next_id: AtomicU32,
    slots: Mutex<Option<HashMap<PipeId, Slot>>>,
}

impl Default for PipeTable {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            slots: Mutex::new(Some(HashMap::new())),
        }
    }
}

impl PipeTable {
    fn register(&self, slot: Slot) -> Option<PipeId> {
        let mut slots = self.slots.lock();
        let slots = slots.as_mut()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slots.insert(id, slot);
        Some(id)
    }

    fn remove(&self, id: PipeId) {
        if let Some(slots) = self.slots.lock().as_mut() {
            slots.remove(&id);
        }
    }

    /// Forget a reading end whose reader went away, telling a connected writer
    fn drop_reader(&self, channel: &Channel, id: PipeId) {
        let slot = self.slots.lock().as_mut().and_then(|t| t.remove(&id));
        if let Some(Slot::Reader { peer: Some(peer), .. }) = slot {
            if !channel.is_closed() {
                let _ = channel.send(Command::PipeDead { target: peer });
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Route one pipe command to its local end
    pub(crate) fn handle(&self, channel: &Channel, command: Command) {
        match command {
            Command::PipeConnect { target, peer } => {
                let mut slots = self.slots.lock();
                let Some(table) = slots.as_mut() else { return };
                match table.get_mut(&target) {
                    Some(Slot::Reader { tx, peer: slot_peer }) => {
                        *slot_peer = Some(peer);
                        let event = PipeEvent::Connected {
                            channel: channel.clone(),
                            local: target,
                            peer,
                        };
                        if tx.send(event).is_err() {
                            table.remove(&target);
                            let _ = channel.send(Command::PipeDead { target: peer });
                        }
                    }
                    Some(Slot::Writer(shared)) => {
                        let shared = shared.clone();
                        drop(slots);
                        shared.connect(channel, peer);
                    }
                    None => {
                        debug!("Connect for unknown pipe {}", target);
                        let _ = channel.send(Command::PipeDead { target: peer });
                    }
                }
            }
            Command::PipeData { target, data } => self.deliver(channel, target, PipeEvent::Data(data)),
            Command::PipeEof { target } => {
                self.deliver(channel, target, PipeEvent::Eof);
                self.remove(target);
            }
            Command::PipeAck { target, size } => {
                if let Some(Slot::Writer(shared)) = self.slots.lock().as_ref().and_then(|t| t.get(&target)) {
                    shared.acknowledge(size);
                }
            }
            Command::PipeDead { target } => {
                let slot = self.slots.lock().as_mut().and_then(|t| t.remove(&target));
                if let Some(Slot::Writer(shared)) = slot {
                    debug!("Reader of pipe {} went away", target);
                    shared.kill("the reading end of the pipe was closed".to_string());
                }
            }
            other => debug!("Not a pipe command: {}", other),
        }
    }

    fn deliver(&self, channel: &Channel, target: PipeId, event: PipeEvent) {
        let mut slots = self.slots.lock();
        let Some(table) = slots.as_mut() else { return };
        let dead_peer = match table.get(&target) {
            Some(Slot::Reader { tx, peer }) => match tx.send(event) {
                Ok(()) => return,
                Err(_) => *peer,
            },
            _ => {
                debug!("Dropping data for unknown pipe {}", target);
                return;
            }
        };
        table.remove(&target);
        if let Some(peer) = dead_peer {
            let _ = channel.send(Command::PipeDead { target: peer });
        }
    }

    /// Fail every open end
    pub(crate) fn abort(&self, cause: &str) {
        let slots = self.slots.lock().take().unwrap_or_default();
        for (_, slot) in slots {
            match slot {
                Slot::Reader { tx, .. } => {
                    let _ = tx.send(PipeEvent::Aborted(cause.to_string()));
                }
                Slot::Writer(shared) => shared.kill(cause.to_string()),
            }
        }
    }
}

/// Slot a reading end was registered under when its pipe was sent
type Registration = Arc<Mutex<Option<(Channel, PipeId)>>>;

/// Reading end of a pipe
pub struct PipeReader {
    events: mpsc::UnboundedReceiver<PipeEvent>,
    link: Option<(Channel, PipeId, PipeId)>,
    registration: Registration,
    buffer: Bytes,
    chunk: usize,
    finished: bool,
}

impl PipeReader {
    fn new(
        events: mpsc::UnboundedReceiver<PipeEvent>,
        link: Option<(Channel, PipeId, PipeId)>,
        registration: Registration,
    ) -> Self {
        Self {
            events,
            link,
            registration,
            buffer: Bytes::new(),
            chunk: 0,
            finished: false,
        }
    }

    fn acknowledge(&mut self) {
        let size = std::mem::take(&mut self.chunk);
        if let Some((channel, _, peer)) = &self.link {
            if size > 0 && channel.capability().supports_pipe_flow_control() {
                let _ = channel.send(Command::PipeAck {
                    target: *peer,
                    size: size as u32,
                });
            }
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buffer.is_empty() {
                let n = this.buffer.len().min(buf.remaining());
                buf.put_slice(&this.buffer.split_to(n));
                if this.buffer.is_empty() {
                    this.acknowledge();
                }
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.events.poll_recv(cx)) {
                Some(PipeEvent::Connected { channel, local, peer }) => {
                    this.link = Some((channel, local, peer));
                }
                Some(PipeEvent::Data(data)) => {
                    this.chunk = data.len();
                    this.buffer = data;
                    if this.buffer.is_empty() {
                        this.acknowledge();
                    }
                }
                Some(PipeEvent::Eof) => this.finished = true,
                Some(PipeEvent::Aborted(cause)) => {
                    this.finished = true;
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, cause)));
                }
                None => {
                    this.finished = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe closed before end of stream",
                    )));
                }
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some((channel, local, peer)) = self.link.take() {
            channel.inner().pipes.remove(local);
            if !channel.is_closed() {
                let _ = channel.send(Command::PipeDead { target: peer });
            }
        } else if let Some((channel, local)) = self.registration.lock().take() {
            // sent but not connected yet
            channel.inner().pipes.drop_reader(&channel, local);
        }
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader")
            .field("buffered", &self.buffer.len())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Writing end of a pipe
pub struct PipeWriter {
    shared: Arc<WriterShared>,
    closed: bool,
}

impl PipeWriter {
    async fn connected(&self) -> io::Result<(Channel, PipeId)> {
        let mut link = self.shared.link.subscribe();
        let link = link
            .wait_for(|l| !matches!(l, Link::Pending))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe dropped"))?
            .clone();
        match link {
            Link::Connected { channel, target } => Ok((channel, target)),
            Link::Dead(cause) => Err(io::Error::new(io::ErrorKind::BrokenPipe, cause)),
            Link::Pending => Err(io::Error::new(io::ErrorKind::NotConnected, "pipe is not connected")),
        }
    }

    fn check_alive(&self) -> io::Result<()> {
        match &*self.shared.link.borrow() {
            Link::Dead(cause) => Err(io::Error::new(io::ErrorKind::BrokenPipe, cause.clone())),
            _ => Ok(()),
        }
    }

    /// Send all of `data`, waiting for the pipe to connect and for credit
    pub async fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed"));
        }
        let (channel, target) = self.connected().await?;
        let flow_control = channel.capability().supports_pipe_flow_control();
        let chunk_size = CHUNK_SIZE.min(channel.inner().config.pipe_window.max(1));

        while !data.is_empty() {
            let n = data.len().min(chunk_size);
            if flow_control {
                self.shared
                    .window
                    .acquire_many(n as u32)
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed by peer"))?
                    .forget();
            }
            self.check_alive()?;
            channel
                .send(Command::PipeData {
                    target,
                    data: Bytes::copy_from_slice(&data[..n]),
                })
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Signal end of stream
    pub async fn close(mut self) -> io::Result<()> {
        let (channel, target) = self.connected().await?;
        self.closed = true;
        self.shared.finish(&channel, target);
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.shared.eof_on_connect.store(true, Ordering::SeqCst);
        let link = self.shared.link.borrow().clone();
        match link {
            Link::Connected { channel, target } => {
                if self.shared.eof_on_connect.swap(false, Ordering::SeqCst) && !channel.is_closed() {
                    self.shared.finish(&channel, target);
                }
            }
            Link::Pending | Link::Dead(_) => {}
        }
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("available", &self.shared.window.available_permits())
            .field("closed", &self.closed)
            .finish()
    }
}

enum Endpoint {
    Reader(mpsc::UnboundedSender<PipeEvent>, Registration),
    Writer(Arc<WriterShared>),
}

struct PipeState {
    direction: Direction,
    reader: Option<PipeReader>,
    writer: Option<PipeWriter>,
    endpoint: Option<Endpoint>,
}

/// A unidirectional byte stream between the two sides of a channel
pub struct Pipe {
    state: Mutex<PipeState>,
}

impl Pipe {
    /// Pipe written by the peer and read here through [`Pipe::get_in`]
    pub fn create_remote_to_local() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = Registration::default();
        Self {
            state: Mutex::new(PipeState {
                direction: Direction::RemoteToLocal,
                reader: Some(PipeReader::new(rx, None, registration.clone())),
                writer: None,
                endpoint: Some(Endpoint::Reader(tx, registration)),
            }),
        }
    }

    /// Pipe written here through [`Pipe::get_out`] and read by the peer
    pub fn create_local_to_remote() -> Self {
        let shared = WriterShared::new();
        Self {
            state: Mutex::new(PipeState {
                direction: Direction::LocalToRemote,
                reader: None,
                writer: Some(PipeWriter {
                    shared: shared.clone(),
                    closed: false,
                }),
                endpoint: Some(Endpoint::Writer(shared)),
            }),
        }
    }

    /// Take the reading end, if this side reads
    pub fn get_in(&self) -> Option<PipeReader> {
        self.state.lock().reader.take()
    }

    /// Take the writing end, if this side writes
    pub fn get_out(&self) -> Option<PipeWriter> {
        self.state.lock().writer.take()
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pipe")
            .field("direction", &state.direction)
            .field("connected", &state.endpoint.is_none())
            .finish()
    }
}

impl Serialize for Pipe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let scope = current::current().ok_or_else(|| S::Error::custom("Pipe can only be serialized by a channel"))?;
        let mut state = self.state.lock();
        let endpoint = state
            .endpoint
            .take()
            .ok_or_else(|| S::Error::custom("pipe has already been sent"))?;
        let pipes = &scope.channel.inner().pipes;

        let wire = match endpoint {
            Endpoint::Reader(tx, registration) => {
                let id = pipes
                    .register(Slot::Reader { tx, peer: None })
                    .ok_or_else(|| S::Error::custom(scope.channel.closed_error()))?;
                *registration.lock() = Some((scope.channel.clone(), id));
                WirePipe {
                    direction: Direction::RemoteToLocal,
                    id,
                }
            }
            Endpoint::Writer(shared) => {
                let id = pipes
                    .register(Slot::Writer(shared.clone()))
                    .ok_or_else(|| S::Error::custom(scope.channel.closed_error()))?;
                *shared.local.lock() = Some(id);
                WirePipe {
                    direction: Direction::LocalToRemote,
                    id,
                }
            }
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Pipe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WirePipe::deserialize(deserializer)?;
        let scope = current::current().ok_or_else(|| D::Error::custom("Pipe can only be deserialized by a channel"))?;
        let channel = scope.channel;
        let pipes = &channel.inner().pipes;

        let state = match wire.direction {
            // the sender reads, this side writes
            Direction::RemoteToLocal => {
                let shared = WriterShared::new();
                let local = pipes
                    .register(Slot::Writer(shared.clone()))
                    .ok_or_else(|| D::Error::custom(channel.closed_error()))?;
                *shared.local.lock() = Some(local);
                channel
                    .send(Command::PipeConnect {
                        target: wire.id,
                        peer: local,
                    })
                    .map_err(D::Error::custom)?;
                shared.connect(&channel, wire.id);
                PipeState {
                    direction: Direction::LocalToRemote,
                    reader: None,
                    writer: Some(PipeWriter { shared, closed: false }),
                    endpoint: None,
                }
            }
            Direction::LocalToRemote => {
                let (tx, rx) = mpsc::unbounded_channel();
                let local = pipes
                    .register(Slot::Reader {
                        tx,
                        peer: Some(wire.id),
                    })
                    .ok_or_else(|| D::Error::custom(channel.closed_error()))?;
                channel
                    .send(Command::PipeConnect {
                        target: wire.id,
                        peer: local,
                    })
                    .map_err(D::Error::custom)?;
                PipeState {
                    direction: Direction::RemoteToLocal,
                    reader: Some(PipeReader::new(
                        rx,
                        Some((channel.clone(), local, wire.id)),
                        Registration::default(),
                    )),
                    writer: None,
                    endpoint: None,
                }
            }
        };
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelBuilder;

    async fn pair() -> (Channel, Channel) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let (a, b) = tokio::join!(ChannelBuilder::new("a").build(lr, lw), ChannelBuilder::new("b").build(rr, rw));
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn test_unconnected_reader_frees_its_slot() {
        let (a, _b) = pair().await;
        let pipe = Pipe::create_remote_to_local();
        let reader = pipe.get_in().unwrap();

        a.encode(&pipe).unwrap();
        assert_eq!(a.inner().pipes.len(), 1);

        drop(reader);
        assert_eq!(a.inner().pipes.len(), 0);
    }

    #[tokio::test]
    async fn test_unsent_pipe_registers_nothing() {
        let (a, _b) = pair().await;
        let pipe = Pipe::create_remote_to_local();
        drop(pipe.get_in());
        assert_eq!(a.inner().pipes.len(), 0);
        assert!(pipe.get_in().is_none());
    }
}
