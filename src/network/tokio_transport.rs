//! Tokio transport: a [`NonBlockingSocket`] backed by two background tasks.
//!
//! The session and its [`UdpProtocol`](crate::__internal::UdpProtocol)s stay synchronous. The
//! transport moves the blocking parts of UDP onto the tokio runtime:
//!
//! ```text
//!   simulation thread                         tokio runtime
//! ┌──────────────────────┐   OutboundQueue   ┌─────────────────────────────┐
//! │ send_to()  ─ encode ─┼──────────────────►│ send pump ─ jitter ─ socket │
//! │                      │  (drop oldest)    │                             │
//! │ receive_all_messages │◄──────────────────┼ recv pump ─ decode ─ socket │
//! └──────────────────────┘   bounded mpsc    └─────────────────────────────┘
//! ```
//!
//! - `send_to` encodes on the caller's thread and never blocks. When the outbound queue is full
//!   the oldest datagram is dropped, which is what the network would do to it anyway.
//! - The receive pump drops malformed datagrams with a log line, and drops decoded messages when
//!   the channel is full.
//! - Both tasks share one [`ShutdownSignal`]. On shutdown the send pump flushes what is queued
//!   before stopping; the receive pump stops at once.
//!
//! # Example
//!
//! ```no_run
//! use rampart_rollback::{NonBlockingSocket, TokioTransport, TransportConfig};
//!
//! # async fn example() -> Result<(), rampart_rollback::RampartError> {
//! let mut transport =
//!     TokioTransport::bind("127.0.0.1:7000".parse().unwrap(), TransportConfig::default()).await?;
//! let _messages = transport.receive_all_messages();
//! transport.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use web_time::Duration;

use crate::network::codec;
use crate::network::messages::Message;
use crate::report_violation;
use crate::rng::{Pcg32, Rng as _, SeedableRng};
use crate::sessions::config::TransportConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{NonBlockingSocket, RampartError};

const RECV_BUFFER_SIZE: usize = 4096;

/// Cooperative cancellation shared by a transport's tasks.
///
/// Cloning is cheap; every clone observes the same trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Asks every task holding a clone to stop. Triggering twice is harmless.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Whether [`trigger`](Self::trigger) has been called.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the signal is triggered.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so `changed` only fails if that invariant breaks.
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Bounded FIFO of encoded datagrams between `send_to` and the send pump.
#[derive(Debug)]
struct OutboundQueue {
    datagrams: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            datagrams: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, addr: SocketAddr, bytes: Vec<u8>) {
        {
            let mut datagrams = self.datagrams.lock();
            if datagrams.len() >= self.capacity {
                datagrams.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%addr, "outbound queue full, dropped oldest datagram");
            }
            datagrams.push_back((addr, bytes));
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<(SocketAddr, Vec<u8>)> {
        self.datagrams.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.datagrams.lock().len()
    }
}

/// A [`NonBlockingSocket`] whose I/O runs on tokio tasks.
///
/// Must be created from within a tokio runtime. Dropping the transport triggers its shutdown
/// signal without waiting; call [`shutdown`](Self::shutdown) to flush and join.
#[derive(Debug)]
pub struct TokioTransport {
    local_addr: SocketAddr,
    outbound: Arc<OutboundQueue>,
    inbound: mpsc::Receiver<(SocketAddr, Message)>,
    shutdown: ShutdownSignal,
    send_task: Option<JoinHandle<()>>,
    recv_task: Option<JoinHandle<()>>,
}

impl TokioTransport {
    /// Binds a UDP socket to `addr` and starts the pumps.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self, RampartError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| RampartError::SocketError {
                context: format!("failed to bind {}: {}", addr, e),
            })?;
        Self::from_socket(socket, config)
    }

    /// Starts the pumps on an already bound socket.
    pub fn from_socket(socket: UdpSocket, config: TransportConfig) -> Result<Self, RampartError> {
        config.validate()?;
        let local_addr = socket.local_addr().map_err(|e| RampartError::SocketError {
            context: format!("failed to read local address: {}", e),
        })?;

        let socket = Arc::new(socket);
        let outbound = Arc::new(OutboundQueue::new(config.send_queue_capacity));
        let (inbound_tx, inbound) = mpsc::channel(config.recv_channel_capacity);
        let shutdown = ShutdownSignal::new();
        let rng = match config.jitter_seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };

        let send_task = tokio::spawn(send_pump(
            Arc::clone(&socket),
            Arc::clone(&outbound),
            shutdown.clone(),
            config.jitter,
            rng,
        ));
        let recv_task = tokio::spawn(recv_pump(socket, inbound_tx, shutdown.clone()));

        tracing::debug!(%local_addr, "tokio transport started");
        Ok(Self {
            local_addr,
            outbound,
            inbound,
            shutdown,
            send_task: Some(send_task),
            recv_task: Some(recv_task),
        })
    }

    /// The address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle on the shutdown signal shared by both pumps.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Datagrams dropped because the outbound queue was full.
    #[must_use]
    pub fn dropped_outbound(&self) -> u64 {
        self.outbound.dropped.load(Ordering::Relaxed)
    }

    /// Datagrams waiting for the send pump.
    #[must_use]
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Triggers shutdown, lets the send pump flush its queue and waits for both tasks.
    pub async fn shutdown(mut self) -> Result<(), RampartError> {
        self.shutdown.trigger();
        for task in [self.send_task.take(), self.recv_task.take()]
            .into_iter()
            .flatten()
        {
            task.await.map_err(|e| RampartError::InternalError {
                context: format!("transport task failed: {}", e),
            })?;
        }
        tracing::debug!(local_addr = %self.local_addr, "tokio transport stopped");
        Ok(())
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl NonBlockingSocket<SocketAddr> for TokioTransport {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        match codec::encode(msg) {
            Ok(bytes) => self.outbound.push(*addr, bytes),
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::Encoding,
                    "Failed to serialize message: {}",
                    e
                );
            },
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received = Vec::with_capacity(4);
        while let Ok(entry) = self.inbound.try_recv() {
            received.push(entry);
        }
        received
    }
}

fn jitter_delay(rng: &mut Pcg32, jitter: Duration) -> Duration {
    let max_us = jitter.as_micros().min(u128::from(u32::MAX - 1)) as u32;
    Duration::from_micros(u64::from(rng.gen_range(0..max_us + 1)))
}

async fn send_pump(
    socket: Arc<UdpSocket>,
    queue: Arc<OutboundQueue>,
    shutdown: ShutdownSignal,
    jitter: Duration,
    mut rng: Pcg32,
) {
    loop {
        while let Some((addr, bytes)) = queue.pop() {
            if !jitter.is_zero() && !shutdown.is_triggered() {
                tokio::time::sleep(jitter_delay(&mut rng, jitter)).await;
            }
            if let Err(e) = socket.send_to(&bytes, addr).await {
                tracing::debug!(%addr, error = %e, "failed to send datagram");
            }
        }

        if shutdown.is_triggered() {
            break;
        }

        // A push between `pop` returning None and this wait leaves a stored permit.
        tokio::select! {
            () = queue.notify.notified() => {},
            () = shutdown.triggered() => {},
        }
    }
    tracing::trace!("send pump stopped");
}

async fn recv_pump(
    socket: Arc<UdpSocket>,
    inbound: mpsc::Sender<(SocketAddr, Message)>,
    shutdown: ShutdownSignal,
) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, addr) = tokio::select! {
            biased;
            () = shutdown.triggered() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                // datagram sockets sometimes report this after a send to a closed port
                Err(ref e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        e.kind(),
                        e
                    );
                    break;
                },
            },
        };

        let Some(datagram) = buffer.get(..len) else {
            continue;
        };
        let message = match codec::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%addr, bytes = len, error = %e, "dropping malformed datagram");
                continue;
            },
        };

        match inbound.try_send((addr, message)) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(%addr, "inbound channel full, dropping message");
            },
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    tracing::trace!("receive pump stopped");
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{InputAck, MessageBody, MessageHeader};
    use crate::Frame;

    fn ack(sequence: u16, frame: i32) -> Message {
        Message {
            header: MessageHeader {
                magic: 0xBEEF,
                sequence,
            },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(frame),
            }),
        }
    }

    async fn loopback(config: TransportConfig) -> TokioTransport {
        TokioTransport::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap()
    }

    async fn wait_for(transport: &mut TokioTransport, count: usize) -> Vec<(SocketAddr, Message)> {
        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(transport.receive_all_messages());
            if received.len() >= count {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        received
    }

    #[test]
    fn outbound_queue_drops_oldest() {
        let queue = OutboundQueue::new(2);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        queue.push(addr, vec![1]);
        queue.push(addr, vec![2]);
        queue.push(addr, vec![3]);

        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pop().unwrap().1, vec![2]);
        assert_eq!(queue.pop().unwrap().1, vec![3]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn jitter_delay_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(3);
        let jitter = Duration::from_millis(5);
        for _ in 0..1000 {
            assert!(jitter_delay(&mut rng, jitter) <= jitter);
        }
    }

    #[tokio::test]
    async fn shutdown_signal_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.triggered().await });

        assert!(!signal.is_triggered());
        signal.trigger();
        task.await.unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn loopback_round_trip() {
        let mut a = loopback(TransportConfig::default()).await;
        let mut b = loopback(TransportConfig::default()).await;
        let b_addr = b.local_addr();

        a.send_to(&ack(1, 10), &b_addr);
        a.send_to(&ack(2, 11), &b_addr);

        let received = wait_for(&mut b, 2).await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, a.local_addr());
        assert_eq!(received[0].1, ack(1, 10));
        assert_eq!(received[1].1, ack(2, 11));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn full_send_queue_keeps_newest_datagrams() {
        let mut b = loopback(TransportConfig::default()).await;
        let mut a = loopback(TransportConfig {
            send_queue_capacity: 2,
            ..TransportConfig::default()
        })
        .await;
        let b_addr = b.local_addr();

        // single-threaded runtime: the send pump cannot run until this task yields
        for seq in 1..=5u16 {
            a.send_to(&ack(seq, i32::from(seq)), &b_addr);
        }
        assert_eq!(a.pending_outbound(), 2);
        assert_eq!(a.dropped_outbound(), 3);

        let received = wait_for(&mut b, 2).await;
        let sequences: Vec<u16> = received.iter().map(|(_, m)| m.header.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);
        assert_eq!(a.pending_outbound(), 0);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped() {
        let mut b = loopback(TransportConfig::default()).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        raw.send_to(&[3, 0, 0, 1], b.local_addr()).await.unwrap();
        raw.send_to(&codec::encode(&ack(4, 2)).unwrap(), b.local_addr())
            .await
            .unwrap();

        let received = wait_for(&mut b, 1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, ack(4, 2));
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_datagrams() {
        let config = TransportConfig::with_jitter(Duration::from_millis(2), 11);
        let a = loopback(config).await;
        let mut b = loopback(TransportConfig::default()).await;
        let b_addr = b.local_addr();

        let mut a = a;
        for seq in 0..5 {
            a.send_to(&ack(seq, i32::from(seq)), &b_addr);
        }
        a.shutdown().await.unwrap();

        let received = wait_for(&mut b, 5).await;
        assert_eq!(received.len(), 5);
        b.shutdown().await.unwrap();
    }
}
