//! Title-routed message bus over connection-per-message TCP.
//!
//! Each replica (and each client) owns one [`MessageBus`]:
//!
//! - **Listener thread**: accepts inbound connections
//! - **Connection handler threads**: short-lived, one per connection. Each reads
//!   exactly one [`Envelope`], stamps the remote host, and enqueues it under
//!   its title
//! - **Callers**: block in [`MessageBus::receive`] on the title they care about
//!
//! Titles double as correlation ids. A request carries a fresh response title
//! and the caller waits on it, which turns the fire-and-forget transport into
//! request/response with a deadline.
//!
//! Queues are competing-consumer: when several threads wait on one title, each
//! envelope is handed to exactly one of them.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::message::{self, Envelope, FrameError};

/// Upper bound on establishing an outbound connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on an inbound connection delivering its frame.
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of a typed receive.
#[derive(Debug)]
pub enum Received<T> {
    Message(T, Envelope),
    /// The envelope arrived but its payload was not a `T`.
    Malformed(Envelope),
    TimedOut,
}

/// Pending envelopes for one title.
struct TitleQueue {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    waiters: usize,
    touched: Instant,
}

impl TitleQueue {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            waiters: 0,
            touched: Instant::now(),
        }
    }
}

pub struct MessageBus {
    local_addr: SocketAddr,
    registry: Mutex<HashMap<String, TitleQueue>>,
    closing: AtomicBool,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Binds the listening socket and starts accepting envelopes.
    ///
    /// Bind to port 0 to get an ephemeral port; [`MessageBus::local_addr`]
    /// reports the one chosen.
    pub fn bind<A: ToSocketAddrs + fmt::Display>(addr: A) -> Result<Arc<Self>> {
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read bound address")?;

        let bus = Arc::new(Self {
            local_addr,
            registry: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            listener_thread: Mutex::new(None),
        });

        let accept_bus = Arc::clone(&bus);
        let handle = thread::Builder::new()
            .name(format!("bus-listener-{local_addr}"))
            .spawn(move || accept_bus.accept_loop(listener))
            .context("failed to spawn bus listener")?;
        *lock(&bus.listener_thread) = Some(handle);

        debug!(addr = %local_addr, "message bus listening");
        Ok(bus)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends `payload` to `addr` under `title`.
    ///
    /// Fire-and-forget: one connection, one frame, close. Failures are logged
    /// and dropped; retrying is the caller's business.
    pub fn send<A: ToSocketAddrs + fmt::Display>(&self, addr: A, title: &str, payload: Vec<u8>) {
        let envelope = Envelope::new(title, self.local_addr.port(), payload);
        if let Err(err) = try_send(&addr, &envelope) {
            warn!(%addr, title, error = %err, "failed to send envelope");
        }
    }

    /// Encodes `value` and sends it under `title`.
    pub fn send_message<A, T>(&self, addr: A, title: &str, value: &T)
    where
        A: ToSocketAddrs + fmt::Display,
        T: Serialize,
    {
        match message::encode(value) {
            Ok(payload) => self.send(addr, title, payload),
            Err(err) => warn!(%addr, title, error = %err, "failed to encode message"),
        }
    }

    /// Waits up to `timeout` for the next envelope under `title`.
    pub fn receive(&self, title: &str, timeout: Duration) -> Option<Envelope> {
        let rx = {
            let mut registry = lock(&self.registry);
            let queue = registry
                .entry(title.to_string())
                .or_insert_with(TitleQueue::new);
            queue.waiters += 1;
            queue.rx.clone()
        };

        let received = rx.recv_timeout(timeout).ok();

        let mut registry = lock(&self.registry);
        if let Some(queue) = registry.get_mut(title) {
            queue.waiters = queue.waiters.saturating_sub(1);
            queue.touched = Instant::now();
        }
        received
    }

    /// Waits for the next envelope under `title` and decodes it as `T`.
    pub fn receive_message<T: DeserializeOwned>(&self, title: &str, timeout: Duration) -> Received<T> {
        match self.receive(title, timeout) {
            None => Received::TimedOut,
            Some(envelope) => match envelope.decode::<T>() {
                Ok(value) => Received::Message(value, envelope),
                Err(_) => Received::Malformed(envelope),
            },
        }
    }

    /// Drops queues nobody is waiting on that have been idle for `grace`.
    ///
    /// Unclaimed envelopes in those queues (replies whose caller already gave
    /// up) are dropped with them. Returns how many titles were removed.
    pub fn evict_idle(&self, grace: Duration) -> usize {
        let mut registry = lock(&self.registry);
        let before = registry.len();
        registry.retain(|_, queue| queue.waiters > 0 || queue.touched.elapsed() < grace);
        let evicted = before - registry.len();
        if evicted > 0 {
            trace!(evicted, remaining = registry.len(), "evicted idle titles");
        }
        evicted
    }

    /// Number of titles currently tracked.
    pub fn title_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Stops accepting connections and joins the listener thread.
    ///
    /// Handler threads already running finish on their own. Blocked receivers
    /// are not woken; they return when their timeout elapses.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unblock accept() so the listener notices the flag.
        let _ = TcpStream::connect_timeout(&wake_addr(self.local_addr), CONNECT_TIMEOUT);
        if let Some(handle) = lock(&self.listener_thread).take() {
            let _ = handle.join();
        }
        debug!(addr = %self.local_addr, "message bus closed");
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.closing.load(Ordering::Acquire) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let bus = Arc::clone(&self);
                    thread::spawn(move || match bus.handle_connection(stream) {
                        Ok(()) => {}
                        Err(FrameError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                            trace!("inbound connection closed before a full frame");
                        }
                        Err(err) if bus.closing.load(Ordering::Acquire) => {
                            trace!(error = %err, "inbound connection cut by shutdown");
                        }
                        Err(err) => warn!(error = %err, "dropped inbound connection"),
                    });
                }
                Err(err) => warn!(error = %err, "accept error"),
            }
        }
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<(), FrameError> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let peer = stream.peer_addr()?;
        let bytes = message::read_frame(&mut stream)?;
        let mut envelope: Envelope = message::decode(&bytes)?;
        envelope.reply_host = Some(peer.ip());
        trace!(title = %envelope.title, %peer, "enqueued envelope");
        self.enqueue(envelope);
        Ok(())
    }

    fn enqueue(&self, envelope: Envelope) {
        let mut registry = lock(&self.registry);
        let queue = registry
            .entry(envelope.title.clone())
            .or_insert_with(TitleQueue::new);
        queue.touched = Instant::now();
        // The queue holds its own receiver, so the channel cannot be disconnected.
        let _ = queue.tx.send(envelope);
    }
}

/// Opens a connection, writes one frame, closes.
fn try_send<A: ToSocketAddrs>(addr: &A, envelope: &Envelope) -> Result<(), FrameError> {
    let bytes = message::encode(envelope)?;
    let mut last_err = None;
    for target in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
            Ok(mut stream) => return message::write_frame(&mut stream, &bytes),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
        .into())
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let loopback = match addr {
            SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
        };
        SocketAddr::new(loopback, addr.port())
    } else {
        addr
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
