//! Client registry: a bounded FIFO of live stream subscribers.
//!
//! Connections are owned by the registry while queued. The dispatcher checks one out
//! per dispatch cycle, serves it, and either checks it back in at the tail or lets it
//! drop. A checked-out connection still counts against the capacity, and so does a
//! reservation held by admission while the stream preamble is being written; the total
//! can never exceed [`CLIENT_CAPACITY`]. Only queued and checked-out clients are
//! enrolled, which is what the dispatcher serves.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, trace};

use crate::stream::multipart;
use crate::{Result, StreamError};

/// Maximum number of concurrent stream clients.
pub const CLIENT_CAPACITY: usize = 10;

/// Identifier assigned to each admitted client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next process-wide identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Byte sink a stream client is served over.
pub trait Transport: AsyncWrite + Unpin + Send + 'static {
    /// Whether the peer has closed its side, checked without blocking.
    fn peer_closed(&self) -> bool {
        false
    }
}

impl Transport for tokio::io::DuplexStream {}

/// A live connection to one stream subscriber.
pub struct ClientConnection<T> {
    id: ClientId,
    transport: T,
    connected: bool,
    frames_sent: u64,
    write_timeout: Option<Duration>,
}

impl<T: Transport> ClientConnection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            id: ClientId::next(),
            transport,
            connected: true,
            frames_sent: 0,
            write_timeout: None,
        }
    }

    /// Bound every write; a write that takes longer counts as a transport failure.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Parts successfully written to this client
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.connected && !self.transport.peer_closed()
    }

    /// Send the stream preamble.
    pub async fn send_preamble(&mut self) -> Result<()> {
        let timeout = self.write_timeout;
        let result = with_timeout(timeout, multipart::write_preamble(&mut self.transport)).await;
        self.settle(result)
    }

    /// Send one multipart part carrying `frame`.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let timeout = self.write_timeout;
        let result = with_timeout(timeout, multipart::write_part(&mut self.transport, frame)).await;
        self.settle(result)?;
        self.frames_sent += 1;
        Ok(())
    }

    fn settle(&mut self, result: std::io::Result<()>) -> Result<()> {
        result.map_err(|e| {
            self.connected = false;
            StreamError::disconnected(self.id, Some(e))
        })
    }

    /// Give back the underlying transport.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T> fmt::Debug for ClientConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("connected", &self.connected)
            .field("frames_sent", &self.frames_sent)
            .finish()
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, write: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, write).await.unwrap_or_else(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "client write timed out"))
        }),
        None => write.await,
    }
}

#[derive(Debug)]
struct Slots<C> {
    queue: VecDeque<C>,
    /// Connections checked out by the dispatcher
    checked_out: usize,
    /// Admissions still writing their preamble
    reserved: usize,
}

impl<C> Slots<C> {
    fn enrolled(&self) -> usize {
        self.queue.len() + self.checked_out
    }

    fn occupied(&self) -> usize {
        self.enrolled() + self.reserved
    }
}

/// Bounded FIFO of stream clients.
#[derive(Debug)]
pub struct ClientRegistry<C> {
    slots: Mutex<Slots<C>>,
    capacity: usize,
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ClientRegistry<C> {
    /// Registry with the fixed [`CLIENT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(CLIENT_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                queue: VecDeque::with_capacity(capacity),
                checked_out: 0,
                reserved: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<C>> {
        // A panic while holding the lock cannot leave the queue half-updated.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots in use: clients queued or being served, plus pending admissions.
    pub fn len(&self) -> usize {
        self.lock().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clients queued or being served. Pending admissions are not counted.
    pub fn enrolled(&self) -> usize {
        self.lock().enrolled()
    }

    /// Clients waiting in the queue right now.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Claim a slot for a client that is about to be admitted.
    ///
    /// Fails with [`StreamError::RegistryFull`] without touching the registry.
    pub fn reserve(&self) -> Result<Reservation<'_, C>> {
        let mut slots = self.lock();
        if slots.occupied() >= self.capacity {
            trace!(capacity = self.capacity, "Registry full, reservation refused");
            return Err(StreamError::RegistryFull { capacity: self.capacity });
        }
        slots.reserved += 1;
        Ok(Reservation { registry: self, committed: false })
    }

    /// Enqueue a client directly, refusing it when full.
    pub fn try_push(&self, client: C) -> std::result::Result<(), C> {
        match self.reserve() {
            Ok(reservation) => {
                reservation.commit(client);
                Ok(())
            }
            Err(_) => Err(client),
        }
    }

    /// Take the client at the head of the queue.
    pub fn checkout(&self) -> Option<CheckedOut<'_, C>> {
        let mut slots = self.lock();
        let client = slots.queue.pop_front()?;
        slots.checked_out += 1;
        Some(CheckedOut { registry: self, client: Some(client) })
    }

    /// Remove every queued client.
    pub fn drain(&self) -> Vec<C> {
        self.lock().queue.drain(..).collect()
    }

    fn release_reservation(&self, client: Option<C>) {
        let mut slots = self.lock();
        slots.reserved -= 1;
        slots.queue.extend(client);
    }

    fn release_checkout(&self, requeue: Option<C>) {
        let mut slots = self.lock();
        slots.checked_out -= 1;
        slots.queue.extend(requeue);
    }
}

/// A slot claimed during admission. Dropping it without [`Reservation::commit`] frees
/// the slot again.
#[derive(Debug)]
pub struct Reservation<'a, C> {
    registry: &'a ClientRegistry<C>,
    committed: bool,
}

impl<C> Reservation<'_, C> {
    /// Append `client` at the tail of the queue.
    pub fn commit(mut self, client: C) {
        self.committed = true;
        self.registry.release_reservation(Some(client));
    }
}

impl<C> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if !self.committed {
            debug!("Admission abandoned, releasing registry slot");
            self.registry.release_reservation(None);
        }
    }
}

/// A client taken from the head of the queue for one dispatch.
///
/// [`CheckedOut::requeue`] appends it at the tail; dropping it discards the client.
#[derive(Debug)]
pub struct CheckedOut<'a, C> {
    registry: &'a ClientRegistry<C>,
    client: Option<C>,
}

impl<C> CheckedOut<'_, C> {
    /// Return the client to the tail of the queue.
    pub fn requeue(mut self) {
        let client = self.client.take();
        self.registry.release_checkout(client);
    }
}

impl<C> std::ops::Deref for CheckedOut<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client.as_ref().expect("client present until requeued or dropped")
    }
}

impl<C> std::ops::DerefMut for CheckedOut<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client.as_mut().expect("client present until requeued or dropped")
    }
}

impl<C> Drop for CheckedOut<'_, C> {
    fn drop(&mut self) {
        if self.client.is_some() {
            self.client = None;
            self.registry.release_checkout(None);
        }
    }
}
