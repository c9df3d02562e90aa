//! Fan-out proxy coordinator.
//!
//! Races one call against every candidate backend:
//!
//! ```text
//!                         +--> session 0: dial, prefix + tail -> A, A -> ?
//! client --> tail pump ---+--> session 1: dial, prefix + tail -> B, B -> ?
//!                         +--> session 2: ...
//!
//! first session to read a response byte claims the client writer;
//! every other session closes its socket.
//! ```
//!
//! - Each session gets its own bounded queue of shared live-tail chunks, so
//!   a slow backend never stalls delivery to a faster one. Before a winner
//!   is declared, a session whose queue fills up drops out of the race;
//!   afterwards the winner's queue applies backpressure to the client.
//! - The end of the client stream is signalled explicitly. A backend only
//!   sees a FIN when the client finished cleanly; a tail cut short (client
//!   error, queue overflow) resets the backend connection instead.
//! - Arbitration is a single compare-and-swap on the race group's winner
//!   cell. Losers observe it and drop their sockets; nothing is interrupted.
//! - Once a winner is declared the decision is final: an error on the
//!   winner ends the call, it never fails over to a loser.
//! - Backend work may run on every candidate (at-least-once per racer).
//! - Arbitration is on the first response byte, whatever it is. For HTTP/2
//!   backends that is usually the server SETTINGS frame, so the race picks
//!   the backend that connects and answers the handshake first.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn, Instrument};

use crate::error::BalancerError;
use crate::policy::{BackendAddr, Policy, PolicyError};

/// Default connect timeout for each candidate.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default size of copy buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default number of live-tail chunks queued per session.
pub const DEFAULT_TAIL_QUEUE_DEPTH: usize = 64;

const NO_WINNER: usize = usize::MAX;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Independent timeout for each dial.
    pub dial_timeout: Duration,
    /// Read buffer size for client and backend copies.
    pub buffer_size: usize,
    /// Live-tail chunks (of at most `buffer_size` bytes) queued per session.
    pub tail_queue_depth: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            tail_queue_depth: DEFAULT_TAIL_QUEUE_DEPTH,
        }
    }
}

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Dialing,
    Racing,
    WinnerForwarding,
    Draining,
    Closed,
    Aborted,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallState::Dialing => "dialing",
            CallState::Racing => "racing",
            CallState::WinnerForwarding => "winner_forwarding",
            CallState::Draining => "draining",
            CallState::Closed => "closed",
            CallState::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Result of a completed call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Backend whose response reached the client.
    pub winner: BackendAddr,
    /// Number of candidates raced.
    pub candidates: usize,
    /// Number of candidates successfully dialed.
    pub dialed: usize,
    /// Number of candidates that could not be dialed.
    pub dial_failures: usize,
    /// Response bytes forwarded to the client.
    pub response_bytes: u64,
    /// Winner's dial-to-first-byte latency.
    pub first_byte_latency: Duration,
}

/// Shared arbitration state of one call.
///
/// The winner cell is the only mutable state shared between sessions. The
/// client writer sits behind it and is handed to whoever wins the cell.
pub struct RaceGroup<W> {
    winner: AtomicUsize,
    client: Mutex<Option<W>>,
    decided: watch::Sender<Option<usize>>,
}

impl<W> RaceGroup<W> {
    pub fn new(client: W) -> Self {
        let (decided, _) = watch::channel(None);
        Self {
            winner: AtomicUsize::new(NO_WINNER),
            client: Mutex::new(Some(client)),
            decided,
        }
    }

    /// Try to become the winner.
    ///
    /// Exactly one caller ever gets `Some(writer)`.
    pub fn claim(&self, session: usize) -> Option<W> {
        self.winner
            .compare_exchange(NO_WINNER, session, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.decided.send_replace(Some(session));
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The declared winner, if any.
    pub fn winner(&self) -> Option<usize> {
        match self.winner.load(Ordering::Acquire) {
            NO_WINNER => None,
            id => Some(id),
        }
    }

    pub fn is_decided(&self) -> bool {
        self.winner().is_some()
    }

    /// Watch the winner cell.
    pub fn subscribe(&self) -> watch::Receiver<Option<usize>> {
        self.decided.subscribe()
    }

    /// Resolves once a session other than `session` has won.
    pub async fn lost(&self, session: usize) {
        let mut rx = self.subscribe();
        // The sender lives as long as the group, so this cannot fail while
        // we hold a reference to it.
        let _ = rx
            .wait_for(|winner| winner.is_some_and(|id| id != session))
            .await;
    }
}

/// How the client side of the live tail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailStatus {
    Streaming,
    Ended,
    Failed,
}

/// Progress reports from sessions to the coordinator.
#[derive(Debug)]
enum SessionEvent {
    Dialed {
        id: usize,
    },
    DialFailed {
        id: usize,
        error: BalancerError,
    },
    Eliminated {
        id: usize,
        error: io::Error,
    },
    Lost {
        id: usize,
    },
    Won {
        id: usize,
        latency: Duration,
    },
    Finished {
        id: usize,
        result: io::Result<u64>,
    },
}

/// Races calls against candidate backends.
pub struct Coordinator {
    config: FanoutConfig,
    policy: Arc<dyn Policy>,
}

impl Coordinator {
    /// Create a coordinator reporting latency feedback to `policy`.
    pub fn new(config: FanoutConfig, policy: Arc<dyn Policy>) -> Self {
        Self { config, policy }
    }

    /// Forward one call.
    ///
    /// `prefix` holds the bytes already consumed from `client`; every dialed
    /// backend receives the prefix followed by the live remainder of the
    /// client stream. Returns once the winner's response has been fully
    /// copied and every loser is closed. The client stream is dropped
    /// (closed) on return, on success and failure alike.
    pub async fn forward<C>(
        &self,
        client: C,
        prefix: Bytes,
        candidates: Vec<BackendAddr>,
    ) -> Result<CallOutcome, BalancerError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        if candidates.is_empty() {
            return Err(BalancerError::NoCandidates(PolicyError::NoBackends));
        }
        let total = candidates.len();
        let (client_reader, client_writer) = tokio::io::split(client);
        let group = Arc::new(RaceGroup::new(client_writer));
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let mut state = CallState::Dialing;
        debug!(state = %state, candidates = total, "Call started");

        let (status_tx, status_rx) = watch::channel(TailStatus::Streaming);
        let mut sessions = JoinSet::new();
        let mut tails = Vec::with_capacity(total);
        for (id, addr) in candidates.iter().cloned().enumerate() {
            let (queue, tail_rx) = mpsc::channel(self.config.tail_queue_depth.max(1));
            let (evict, evicted) = oneshot::channel();
            tails.push(TailSink { id, queue, evict });

            let session = BackendSession {
                id,
                addr: addr.clone(),
                prefix: prefix.clone(),
                tail: tail_rx,
                tail_status: status_rx.clone(),
                evicted,
                group: Arc::clone(&group),
                events: events_tx.clone(),
                policy: Arc::clone(&self.policy),
                config: self.config.clone(),
            };
            sessions.spawn(
                session
                    .run()
                    .instrument(tracing::debug_span!("session", id, backend = %addr)),
            );
        }
        drop(events_tx);

        let mut pump = JoinSet::new();
        pump.spawn(pump_tail(
            client_reader,
            tails,
            status_tx,
            group.subscribe(),
            self.config.buffer_size,
        ));

        let mut dialed = 0usize;
        let mut dial_failures = 0usize;
        let mut winner: Option<(usize, Duration)> = None;
        let mut finished: Option<io::Result<u64>> = None;
        let mut client_error: Option<io::Error> = None;

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Some(joined) = pump.join_next(), if !pump.is_empty() => {
                    // Sessions see the failure through the tail status and
                    // stop on their own.
                    if let Ok(Err(error)) = joined {
                        if !matches!(finished, Some(Ok(_))) {
                            warn!(error = %error, "Client stream failed mid-call");
                            client_error = Some(error);
                        }
                    }
                    continue;
                }
            };

            match event {
                SessionEvent::Dialed { id } => {
                    dialed += 1;
                    debug!(session = id, backend = %candidates[id], "Backend dialed");
                    if state == CallState::Dialing {
                        transition(&mut state, CallState::Racing);
                    }
                }
                SessionEvent::DialFailed { id, error } => {
                    dial_failures += 1;
                    warn!(session = id, error = %error, "Backend dial failed");
                    if dial_failures == total {
                        transition(&mut state, CallState::Aborted);
                        return Err(BalancerError::BackendUnavailable { attempted: total });
                    }
                }
                SessionEvent::Eliminated { id, error } => {
                    debug!(
                        session = id,
                        backend = %candidates[id],
                        error = %error,
                        "Backend dropped out of the race"
                    );
                }
                SessionEvent::Lost { id } => {
                    debug!(session = id, backend = %candidates[id], "Backend lost the race");
                }
                SessionEvent::Won { id, latency } => {
                    winner = Some((id, latency));
                    debug!(
                        session = id,
                        backend = %candidates[id],
                        latency_ms = latency.as_millis() as u64,
                        "Backend won the race"
                    );
                    transition(&mut state, CallState::WinnerForwarding);
                }
                SessionEvent::Finished { id, result } => {
                    debug!(session = id, ok = result.is_ok(), "Winner finished");
                    finished = Some(result);
                    transition(&mut state, CallState::Draining);
                }
            }
        }

        // Every session is done: stop reading the client.
        pump.shutdown().await;
        drop(sessions);

        if let Some(error) = client_error {
            transition(&mut state, CallState::Aborted);
            return Err(BalancerError::Transport(error));
        }

        match (winner, finished) {
            (Some((id, latency)), Some(Ok(response_bytes))) => {
                transition(&mut state, CallState::Closed);
                Ok(CallOutcome {
                    winner: candidates[id].clone(),
                    candidates: total,
                    dialed,
                    dial_failures,
                    response_bytes,
                    first_byte_latency: latency,
                })
            }
            (Some(_), Some(Err(e))) => {
                transition(&mut state, CallState::Aborted);
                Err(BalancerError::Transport(e))
            }
            _ => {
                transition(&mut state, CallState::Aborted);
                if dialed == 0 {
                    Err(BalancerError::BackendUnavailable { attempted: total })
                } else {
                    Err(BalancerError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "every backend closed without responding",
                    )))
                }
            }
        }
    }
}

fn transition(state: &mut CallState, next: CallState) {
    debug!(from = %state, to = %next, "Call state");
    *state = next;
}

/// The pump's end of one session's live-tail queue.
struct TailSink {
    id: usize,
    queue: mpsc::Sender<Bytes>,
    evict: oneshot::Sender<()>,
}

/// Copy the live client stream to the sessions' queues.
///
/// Until a winner is declared every chunk is offered to every session
/// without waiting; a session whose queue is full is dropped from the
/// race. Once a winner is declared only its queue is fed, and the pump
/// waits on it. `status` records how the client stream ended before the
/// queues are closed. Returns the number of bytes read from the client.
async fn pump_tail<R>(
    mut reader: R,
    mut sinks: Vec<TailSink>,
    status: watch::Sender<TailStatus>,
    decided: watch::Receiver<Option<usize>>,
    buffer_size: usize,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        if sinks.is_empty() {
            return Ok(total);
        }
        buf.reserve(buffer_size);
        let n = match reader.read_buf(&mut buf).await {
            Ok(0) => {
                status.send_replace(TailStatus::Ended);
                return Ok(total);
            }
            Ok(n) => n,
            Err(e) => {
                status.send_replace(TailStatus::Failed);
                return Err(e);
            }
        };
        total += n as u64;
        let chunk = buf.split().freeze();

        let winner = *decided.borrow();
        match winner {
            Some(winner) => {
                sinks.retain(|sink| sink.id == winner);
                if let Some(sink) = sinks.first() {
                    if sink.queue.send(chunk).await.is_err() {
                        sinks.clear();
                    }
                }
            }
            None => {
                sinks = std::mem::take(&mut sinks)
                    .into_iter()
                    .filter_map(|sink| match sink.queue.try_send(chunk.clone()) {
                        Ok(()) => Some(sink),
                        Err(TrySendError::Full(_)) => {
                            debug!(
                                session = sink.id,
                                "Tail queue full, dropping session from the race"
                            );
                            let _ = sink.evict.send(());
                            None
                        }
                        Err(TrySendError::Closed(_)) => None,
                    })
                    .collect();
            }
        }
    }
}

/// One outbound connection racing for the call.
struct BackendSession<W> {
    id: usize,
    addr: BackendAddr,
    prefix: Bytes,
    tail: mpsc::Receiver<Bytes>,
    tail_status: watch::Receiver<TailStatus>,
    evicted: oneshot::Receiver<()>,
    group: Arc<RaceGroup<W>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    policy: Arc<dyn Policy>,
    config: FanoutConfig,
}

impl<W> BackendSession<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self) {
        let BackendSession {
            id,
            addr,
            prefix,
            tail,
            tail_status,
            evicted,
            group,
            events,
            policy,
            config,
        } = self;
        let report = |event| {
            // The coordinator outlives every session.
            let _ = events.send(event);
        };

        let started = Instant::now();
        let mut stream = tokio::select! {
            dialed = timeout(config.dial_timeout, TcpStream::connect(addr.as_str())) => {
                match dialed {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(source)) => {
                        report(SessionEvent::DialFailed { id, error: BalancerError::Dial { addr, source } });
                        return;
                    }
                    Err(_) => {
                        let source = io::Error::new(io::ErrorKind::TimedOut, "connect timeout");
                        report(SessionEvent::DialFailed { id, error: BalancerError::Dial { addr, source } });
                        return;
                    }
                }
            }
            _ = group.lost(id) => {
                report(SessionEvent::Lost { id });
                return;
            }
        };
        report(SessionEvent::Dialed { id });

        // A winner may have been declared while we were dialing.
        if group.is_decided() {
            report(SessionEvent::Lost { id });
            return;
        }

        let _ = stream.set_nodelay(true);
        // Borrowed halves: dropping them never half-closes the socket, so
        // an abort below reaches the backend as a reset and nothing else.
        let (mut backend_reader, backend_writer) = stream.split();
        let forward = forward_request(backend_writer, prefix, tail, tail_status, evicted);
        tokio::pin!(forward);
        let mut forwarding = true;
        let mut buf = vec![0u8; config.buffer_size];

        // Racing: keep feeding the request while waiting for response bytes.
        let first = loop {
            tokio::select! {
                done = &mut forward, if forwarding => {
                    forwarding = false;
                    if let Err(error) = done {
                        reset(&backend_reader);
                        report(SessionEvent::Eliminated { id, error });
                        return;
                    }
                }
                read = backend_reader.read(&mut buf) => match read {
                    Ok(0) => {
                        let error = io::Error::new(io::ErrorKind::UnexpectedEof, "closed before responding");
                        report(SessionEvent::Eliminated { id, error });
                        return;
                    }
                    Ok(n) => break n,
                    Err(error) => {
                        report(SessionEvent::Eliminated { id, error });
                        return;
                    }
                },
                _ = group.lost(id) => {
                    report(SessionEvent::Lost { id });
                    return;
                }
            }
        };

        let latency = started.elapsed();
        policy.register_latency(&addr, latency);

        let Some(mut client) = group.claim(id) else {
            report(SessionEvent::Lost { id });
            return;
        };
        report(SessionEvent::Won { id, latency });

        let result = {
            let copy = copy_response(
                &mut backend_reader,
                &mut client,
                &buf[..first],
                config.buffer_size,
            );
            tokio::pin!(copy);
            loop {
                tokio::select! {
                    done = &mut forward, if forwarding => {
                        forwarding = false;
                        if let Err(e) = done {
                            break Err(e);
                        }
                    }
                    copied = &mut copy => break copied,
                }
            }
        };
        if result.is_err() {
            reset(&backend_reader);
        }
        report(SessionEvent::Finished { id, result });
    }
}

/// Make the coming close abortive, so the backend sees a reset rather
/// than a clean end of request.
fn reset(backend: &ReadHalf<'_>) {
    let _ = backend.as_ref().set_zero_linger();
}

/// Write the captured prefix, then every live-tail chunk, in order.
///
/// Half-closes the backend only when the client finished cleanly. A tail
/// that stops for any other reason, including eviction by the pump while a
/// write is blocked, is an error and the backend is left open for the
/// caller to reset.
async fn forward_request<W>(
    mut backend: W,
    prefix: Bytes,
    mut tail: mpsc::Receiver<Bytes>,
    status: watch::Receiver<TailStatus>,
    mut evicted: oneshot::Receiver<()>,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let copy = async {
        let mut total = prefix.len() as u64;
        backend.write_all(&prefix).await?;
        while let Some(chunk) = tail.recv().await {
            backend.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }

        let ended = *status.borrow();
        match ended {
            TailStatus::Ended => {
                backend.shutdown().await?;
                Ok(total)
            }
            TailStatus::Failed => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client stream failed",
            )),
            TailStatus::Streaming => Err(io::Error::other("request tail cut off")),
        }
    };

    // A dropped eviction sender just means the pump is gone; keep copying.
    tokio::select! {
        result = copy => result,
        Ok(()) = &mut evicted => Err(io::Error::other("tail queue overflow")),
    }
}

/// Copy the winner's response to the client, starting with the bytes that
/// won the race.
async fn copy_response<R, W>(
    backend: &mut R,
    client: &mut W,
    first: &[u8],
    buffer_size: usize,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    client.write_all(first).await?;
    let mut total = first.len() as u64;
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = backend.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        client.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    client.shutdown().await?;
    Ok(total)
}
