//! Per-subscriber message queues.
//!
//! Each subscriber id is served by one queue actor that buffers outbound
//! messages while no session is attached and fans them out to one or more
//! attached sessions otherwise. The registry talks to queues through
//! [`QueueHandle`]; queue creation goes through the [`QueueSupervisor`]
//! seam, with single-flight per subscriber id provided by the registry
//! coordinator, not here.
//!
//! A queue terminates when it is migrated into another queue, when it is
//! told to, or when its last attached session disconnects and that session
//! was clean. Termination closes the handle's command channel, which is the
//! liveness signal the coordinator watches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::protocol::{Publish, QoS, SessionEvent, SessionRef, SubscriberId};
use crate::{DriftmqError, Result};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Queue delivery state as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// At least one session is attached.
    Online,
    /// No session attached; messages are buffered.
    Offline,
}

/// How a queue distributes messages across multiple attached sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverMode {
    /// Every session receives every message.
    Fanout,
    /// Messages are balanced round-robin across sessions.
    Balance,
}

/// Options applied to a running queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOpts {
    pub deliver_mode: Option<DeliverMode>,
}

enum QueueCommand {
    Enqueue {
        qos: QoS,
        publish: Publish,
    },
    AddSession {
        session: SessionRef,
        clean: bool,
        queue_present: bool,
    },
    SetOpts(QueueOpts),
    Migrate {
        target: QueueHandle,
        reply: oneshot::Sender<()>,
    },
    GetSessions {
        reply: oneshot::Sender<Vec<SessionRef>>,
    },
    Status {
        reply: oneshot::Sender<(QueueState, usize)>,
    },
    Active,
    Notify,
    Terminate,
}

/// Clonable handle to a queue actor. Equality is queue identity.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    id: u64,
    subscriber: SubscriberId,
    tx: mpsc::UnboundedSender<QueueCommand>,
    depth: Arc<AtomicUsize>,
}

impl PartialEq for QueueHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueueHandle {}

impl QueueHandle {
    /// Process-unique queue identity.
    pub fn queue_id(&self) -> u64 {
        self.id
    }

    pub fn subscriber(&self) -> &SubscriberId {
        &self.subscriber
    }

    /// Enqueue a message for delivery. Non-blocking; fails with `NotFound`
    /// once the queue has terminated.
    pub fn enqueue(&self, qos: QoS, publish: Publish) -> Result<()> {
        self.tx
            .send(QueueCommand::Enqueue { qos, publish })
            .map_err(|_| DriftmqError::NotFound)
    }

    /// Attach a session. `queue_present` tells the session whether the
    /// queue existed before its registration.
    pub fn add_session(&self, session: SessionRef, clean: bool, queue_present: bool) -> Result<()> {
        self.tx
            .send(QueueCommand::AddSession {
                session,
                clean,
                queue_present,
            })
            .map_err(|_| DriftmqError::NotFound)
    }

    pub fn set_opts(&self, opts: QueueOpts) {
        let _ = self.tx.send(QueueCommand::SetOpts(opts));
    }

    /// Transfer buffered messages and attached sessions into `target`,
    /// then terminate. Migrating a queue that already terminated is a no-op.
    pub async fn migrate(&self, target: QueueHandle) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(QueueCommand::Migrate { target, reply })
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub async fn get_sessions(&self) -> Vec<SessionRef> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(QueueCommand::GetSessions { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> Result<(QueueState, usize)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Status { reply })
            .map_err(|_| DriftmqError::NotFound)?;
        rx.await.map_err(|_| DriftmqError::NotFound)
    }

    /// Buffered message count, readable without a round-trip.
    pub fn stored(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Flush buffered messages to attached sessions.
    pub fn active(&self) {
        let _ = self.tx.send(QueueCommand::Active);
    }

    /// Wake the queue to push buffered messages.
    pub fn notify(&self) {
        let _ = self.tx.send(QueueCommand::Notify);
    }

    /// Ask the queue to terminate.
    pub fn terminate(&self) {
        let _ = self.tx.send(QueueCommand::Terminate);
    }

    /// Resolves once the queue actor has exited.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Creates queue actors. Not idempotent: every call starts a fresh queue.
pub trait QueueSupervisor: Send + Sync {
    fn start_queue(&self, id: &SubscriberId) -> QueueHandle;
}

/// Default supervisor spawning one tokio task per queue.
#[derive(Debug, Clone)]
pub struct TaskQueueSupervisor {
    max_queued: usize,
}

impl TaskQueueSupervisor {
    pub fn new(max_queued: usize) -> Self {
        Self { max_queued }
    }
}

impl QueueSupervisor for TaskQueueSupervisor {
    fn start_queue(&self, id: &SubscriberId) -> QueueHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let handle = QueueHandle {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            subscriber: id.clone(),
            tx,
            depth: depth.clone(),
        };
        let actor = QueueActor {
            subscriber: id.clone(),
            max_queued: self.max_queued,
            buffer: VecDeque::new(),
            sessions: Vec::new(),
            mode: DeliverMode::Fanout,
            rr: 0,
            depth,
            dropped: 0,
        };
        tokio::spawn(actor.run(rx));
        handle
    }
}

struct QueueSession {
    session: SessionRef,
    clean: bool,
}

struct QueueActor {
    subscriber: SubscriberId,
    max_queued: usize,
    buffer: VecDeque<(QoS, Publish)>,
    sessions: Vec<QueueSession>,
    mode: DeliverMode,
    rr: usize,
    depth: Arc<AtomicUsize>,
    dropped: u64,
}

impl QueueActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueueCommand>) {
        debug!(subscriber = %self.subscriber, "queue started");
        while let Some(command) = rx.recv().await {
            match command {
                QueueCommand::Enqueue { qos, publish } => {
                    if self.deliver(qos, publish) {
                        break;
                    }
                }
                QueueCommand::AddSession {
                    session,
                    clean,
                    queue_present,
                } => {
                    if session
                        .send(SessionEvent::Attached { queue_present })
                        .is_ok()
                    {
                        self.sessions.push(QueueSession { session, clean });
                        self.flush();
                    }
                }
                QueueCommand::SetOpts(opts) => {
                    if let Some(mode) = opts.deliver_mode {
                        self.mode = mode;
                    }
                }
                QueueCommand::Migrate { target, reply } => {
                    let buffered = self.buffer.len();
                    for (qos, publish) in self.buffer.drain(..) {
                        let _ = target.enqueue(qos, publish);
                    }
                    for entry in self.sessions.drain(..) {
                        let _ = target.add_session(entry.session, entry.clean, true);
                    }
                    self.depth.store(0, Ordering::Relaxed);
                    debug!(
                        subscriber = %self.subscriber,
                        buffered,
                        to = target.queue_id(),
                        "queue migrated"
                    );
                    let _ = reply.send(());
                    break;
                }
                QueueCommand::GetSessions { reply } => {
                    let refs = self.sessions.iter().map(|s| s.session.clone()).collect();
                    let _ = reply.send(refs);
                }
                QueueCommand::Status { reply } => {
                    let state = if self.sessions.is_empty() {
                        QueueState::Offline
                    } else {
                        QueueState::Online
                    };
                    let _ = reply.send((state, self.buffer.len()));
                }
                QueueCommand::Active | QueueCommand::Notify => {
                    if self.flush() {
                        break;
                    }
                }
                QueueCommand::Terminate => break,
            }
        }
        debug!(subscriber = %self.subscriber, dropped = self.dropped, "queue terminated");
    }

    /// Deliver one message, buffering when no session is attached.
    /// Returns true when the queue should terminate (its last session
    /// detached and was clean).
    fn deliver(&mut self, qos: QoS, publish: Publish) -> bool {
        if self.sessions.is_empty() {
            self.buffer_push(qos, publish);
            return false;
        }

        let mut delivered = false;
        let mut clean_detached = false;

        match self.mode {
            DeliverMode::Fanout => {
                let event = SessionEvent::Deliver {
                    qos,
                    publish: publish.clone(),
                };
                self.sessions.retain(|entry| {
                    if entry.session.send(event.clone()).is_ok() {
                        delivered = true;
                        true
                    } else {
                        clean_detached |= entry.clean;
                        false
                    }
                });
            }
            DeliverMode::Balance => {
                while !self.sessions.is_empty() && !delivered {
                    let idx = self.rr % self.sessions.len();
                    let event = SessionEvent::Deliver {
                        qos,
                        publish: publish.clone(),
                    };
                    if self.sessions[idx].session.send(event).is_ok() {
                        self.rr = self.rr.wrapping_add(1);
                        delivered = true;
                    } else {
                        clean_detached |= self.sessions[idx].clean;
                        self.sessions.remove(idx);
                    }
                }
            }
        }

        if !delivered {
            if self.sessions.is_empty() && clean_detached {
                return true;
            }
            self.buffer_push(qos, publish);
        }
        false
    }

    /// Push buffered messages to attached sessions. Returns true when the
    /// queue should terminate.
    fn flush(&mut self) -> bool {
        while !self.buffer.is_empty() && !self.sessions.is_empty() {
            let (qos, publish) = match self.buffer.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            if self.deliver(qos, publish) {
                return true;
            }
        }
        self.depth.store(self.buffer.len(), Ordering::Relaxed);
        false
    }

    fn buffer_push(&mut self, qos: QoS, publish: Publish) {
        if self.buffer.len() >= self.max_queued {
            self.dropped += 1;
            debug!(
                subscriber = %self.subscriber,
                "queue full, dropping message"
            );
        } else {
            self.buffer.push_back((qos, publish));
        }
        self.depth.store(self.buffer.len(), Ordering::Relaxed);
    }
}
