//! Broker -- the agent's event loop and composition root.
//!
//! One task drives everything application-visible: inbound dispatch and
//! scheduled tasks run on it one at a time, never concurrently. A separate
//! receive task only reads datagrams off the listener and queues them.
//!
//! State machine: Created → Running → Stopping → Stopped.
//!
//! Posted sends go through a single outbox task, so they reach the
//! transport in the order they were posted.
//!
//! On stop, work that was already due completes and posted sends are
//! flushed. Timers not yet due are discarded, then connections close.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dgi_protocol::{Message, MessageCodec, PeerIdentity};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use crate::connection_manager::ConnectionManager;
use crate::dispatcher::{Dispatcher, HandlerContext};
use crate::error::BrokerError;

/// Receive buffer; larger than any datagram the codec will produce.
const RECV_BUFFER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl BrokerState {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerState::Created => "created",
            BrokerState::Running => "running",
            BrokerState::Stopping => "stopping",
            BrokerState::Stopped => "stopped",
        }
    }
}

/// Work deferred onto the event loop.
pub type Task = Box<dyn FnOnce(&Broker) + Send + 'static>;

const TIMER_PENDING: u8 = 0;
const TIMER_FIRED: u8 = 1;
const TIMER_CANCELLED: u8 = 2;

/// Cancel handle for a scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    fn pending() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(TIMER_PENDING)),
        }
    }

    fn cancelled() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(TIMER_CANCELLED)),
        }
    }

    /// Cancel the task. Returns true iff it has not fired and never will.
    pub fn cancel(&self) -> bool {
        match self.state.compare_exchange(
            TIMER_PENDING,
            TIMER_CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == TIMER_CANCELLED,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_FIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_CANCELLED
    }

    /// Claim the right to run. Loses against a prior cancel.
    fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(
                TIMER_PENDING,
                TIMER_FIRED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Task,
    handle: TimerHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

enum LoopEvent {
    Inbound(Message),
    Schedule(TimerEntry),
}

/// Work for the outbox task, handled strictly in queue order.
enum Outbound {
    Send(PeerIdentity, Message),
    /// Acknowledged once everything queued before it has been sent.
    Flush(oneshot::Sender<()>),
}

/// Pieces consumed by the one and only call to `run`.
struct LoopParts {
    events: mpsc::UnboundedReceiver<LoopEvent>,
    listener: UdpSocket,
}

/// Where the broker listens and who it is.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub identity: PeerIdentity,
    pub listen_addr: SocketAddr,
    /// Address peers should reply to. Defaults to the bound listener address
    /// (with an unspecified IP replaced by loopback).
    pub advertise_addr: Option<SocketAddr>,
}

pub(crate) struct BrokerShared {
    identity: PeerIdentity,
    local_addr: SocketAddr,
    advertise_addr: SocketAddr,
    pub(crate) dispatcher: Arc<Dispatcher>,
    manager: ConnectionManager,
    state: Mutex<BrokerState>,
    stop_requested: AtomicBool,
    stop: Notify,
    events: mpsc::UnboundedSender<LoopEvent>,
    outbox: mpsc::UnboundedSender<Outbound>,
    loop_parts: Mutex<Option<LoopParts>>,
    next_seq: AtomicU64,
}

/// Shared handle to the agent's broker.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Broker {
    /// Bind the inbound listener and wire the manager back to this broker.
    pub async fn bind(
        config: BrokerConfig,
        manager: ConnectionManager,
        dispatcher: Dispatcher,
    ) -> Result<Self, BrokerError> {
        let listener = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| BrokerError::Bind {
            addr: config.listen_addr,
            source,
        })?;
        let advertise_addr = config
            .advertise_addr
            .unwrap_or_else(|| reachable_addr(local_addr));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BrokerShared {
            identity: config.identity,
            local_addr,
            advertise_addr,
            dispatcher: Arc::new(dispatcher),
            manager,
            state: Mutex::new(BrokerState::Created),
            stop_requested: AtomicBool::new(false),
            stop: Notify::new(),
            events: events_tx,
            outbox: outbox_tx,
            loop_parts: Mutex::new(Some(LoopParts {
                events: events_rx,
                listener,
            })),
            next_seq: AtomicU64::new(0),
        });
        shared.manager.attach_broker(Arc::downgrade(&shared));
        tokio::spawn(outbox_loop(Arc::downgrade(&shared), outbox_rx));

        tracing::info!(
            identity = %shared.identity,
            %local_addr,
            %advertise_addr,
            "broker: listener bound"
        );
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<BrokerShared>) -> Self {
        Self { shared }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.shared.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.shared.advertise_addr
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.shared.manager
    }

    pub fn state(&self) -> BrokerState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: BrokerState) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            tracing::info!(from = state.name(), to = next.name(), "broker: state transition");
            *state = next;
        }
    }

    /// Run `task` on the event loop once at least `delay` has elapsed.
    ///
    /// Once the broker is stopping, nothing new is admitted and the
    /// returned handle is already cancelled.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce(&Broker) + Send + 'static,
    {
        if matches!(self.state(), BrokerState::Stopping | BrokerState::Stopped) {
            tracing::debug!(?delay, "broker: schedule refused, broker is stopping");
            return TimerHandle::cancelled();
        }

        let handle = TimerHandle::pending();
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            task: Box::new(task),
            handle: handle.clone(),
        };
        if self.shared.events.send(LoopEvent::Schedule(entry)).is_err() {
            handle.cancel();
        }
        handle
    }

    /// Request orderly shutdown. Safe from any thread; idempotent.
    pub fn stop(&self) {
        if self.shared.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == BrokerState::Running {
                tracing::info!(from = state.name(), to = "stopping", "broker: state transition");
                *state = BrokerState::Stopping;
            }
        }
        tracing::info!(identity = %self.shared.identity, "broker: stop requested");
        self.shared.stop.notify_one();
    }

    /// Drive the event loop until `stop` is called.
    ///
    /// A broker runs at most once; later calls fail with `AlreadyStarted`.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let parts = self
            .shared
            .loop_parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(LoopParts {
            mut events,
            listener,
        }) = parts
        else {
            return Err(BrokerError::AlreadyStarted);
        };

        self.set_state(BrokerState::Running);
        let receiver = tokio::spawn(receive_loop(listener, self.shared.events.clone()));

        let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
        loop {
            if self.shared.stop_requested.load(Ordering::Acquire) {
                break;
            }
            let next_deadline = timers.peek().map(|Reverse(t)| t.deadline);

            tokio::select! {
                biased;
                _ = self.shared.stop.notified() => {}
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &mut timers).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    self.fire_due(&mut timers, Instant::now());
                }
            }
        }

        self.set_state(BrokerState::Stopping);
        receiver.abort();

        // Drain what was admitted before the stop, then run what is due.
        let stop_at = Instant::now();
        while let Ok(event) = events.try_recv() {
            self.handle_event(event, &mut timers).await;
        }
        let fired = self.fire_due(&mut timers, stop_at);
        let discarded = timers.len();
        for Reverse(entry) in timers.drain() {
            entry.handle.cancel();
        }
        if discarded > 0 {
            tracing::debug!(discarded, "broker: future timers discarded at shutdown");
        }

        self.flush_outbox().await;
        let closed = self.shared.manager.remove_all().await;
        self.set_state(BrokerState::Stopped);
        tracing::info!(
            identity = %self.shared.identity,
            fired,
            discarded,
            closed,
            "broker: event loop stopped"
        );
        Ok(())
    }

    async fn handle_event(&self, event: LoopEvent, timers: &mut BinaryHeap<Reverse<TimerEntry>>) {
        match event {
            LoopEvent::Inbound(message) => self.deliver(message).await,
            LoopEvent::Schedule(entry) => {
                if !entry.handle.is_cancelled() {
                    timers.push(Reverse(entry));
                }
            }
        }
    }

    /// Record the sender, make sure a connection back exists, dispatch.
    async fn deliver(&self, message: Message) {
        let source = message.source.clone();
        if source != self.shared.identity {
            let manager = &self.shared.manager;
            if let Some(addr) = message.reply_to {
                manager.put_host(source.clone(), addr).await;
            }
            if let Err(e) = manager.get_or_create_connection(&source).await {
                tracing::debug!(peer = %source, "broker: no connection to sender: {e}");
            }
        }

        let ctx = HandlerContext::new(self, &source);
        self.shared.dispatcher.dispatch(&message, &ctx);
    }

    /// Fire every timer due at or before `now`, earliest first.
    fn fire_due(&self, timers: &mut BinaryHeap<Reverse<TimerEntry>>, now: Instant) -> usize {
        let mut fired = 0;
        while timers.peek().is_some_and(|Reverse(t)| t.deadline <= now) {
            let Some(Reverse(entry)) = timers.pop() else {
                break;
            };
            if !entry.handle.try_fire() {
                continue;
            }
            fired += 1;
            let task = entry.task;
            if catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
                tracing::error!(seq = entry.seq, "broker: scheduled task panicked");
            }
        }
        fired
    }

    /// Send `message` to `to`.
    ///
    /// Stamps the envelope, runs outbound handlers, then hands the message
    /// to the destination's connection. Messages addressed to this agent
    /// loop back through the event loop without touching a socket.
    pub async fn send(&self, to: &PeerIdentity, mut message: Message) -> Result<(), BrokerError> {
        let state = self.state();
        if state == BrokerState::Stopped {
            return Err(BrokerError::Stopped);
        }

        message.source = self.shared.identity.clone();
        message.reply_to = Some(self.shared.advertise_addr);
        {
            let ctx = HandlerContext::new(self, to);
            self.shared.dispatcher.prepare_outbound(&mut message, &ctx);
        }

        if *to == self.shared.identity {
            if state == BrokerState::Stopping {
                tracing::debug!(kind = %message.kind, "broker: loopback refused while stopping");
            } else {
                // The receiver only goes away with the broker itself.
                let _ = self.shared.events.send(LoopEvent::Inbound(message));
            }
            return Ok(());
        }

        let conn = self.shared.manager.get_or_create_connection(to).await?;
        conn.send(&message).await?;
        Ok(())
    }

    /// Fire-and-forget `send` for synchronous handler code.
    ///
    /// Posts are queued on one outbox and sent in posting order. Failures
    /// are logged, not returned.
    pub fn post(&self, to: PeerIdentity, message: Message) {
        if self.shared.outbox.send(Outbound::Send(to, message)).is_err() {
            tracing::warn!("broker: outbox closed, post dropped");
        }
    }

    /// Wait until every post queued so far has been handed to its connection.
    async fn flush_outbox(&self) {
        let (done, flushed) = oneshot::channel();
        if self.shared.outbox.send(Outbound::Flush(done)).is_ok() {
            let _ = flushed.await;
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("identity", &self.shared.identity)
            .field("local_addr", &self.shared.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Drain posted sends one at a time. Ends when the broker is dropped.
async fn outbox_loop(shared: Weak<BrokerShared>, mut outbox: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbox.recv().await {
        match item {
            Outbound::Send(to, message) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let broker = Broker::from_shared(shared);
                if let Err(e) = broker.send(&to, message).await {
                    tracing::warn!(peer = %to, "broker: send failed: {e}");
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Read datagrams off the listener and queue them for the loop.
async fn receive_loop(listener: UdpSocket, events: mpsc::UnboundedSender<LoopEvent>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    let mut codec = MessageCodec;
    loop {
        match listener.recv_from(&mut buf).await {
            Ok((n, from)) => match codec.decode_datagram(&buf[..n]) {
                Ok(message) => {
                    tracing::trace!(%from, kind = %message.kind, "broker: datagram received");
                    if events.send(LoopEvent::Inbound(message)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        %from,
                        bytes = n,
                        "broker: discarding undecodable datagram: {e}"
                    );
                }
            },
            Err(e) => {
                tracing::warn!("broker: receive error: {e}");
                tokio::task::yield_now().await;
            }
        }
    }
}

/// An address peers can actually send to.
fn reachable_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, local.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, local.port()).into(),
        _ => local,
    }
}
