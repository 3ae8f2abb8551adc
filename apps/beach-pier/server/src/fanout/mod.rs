//! Live fanout of upstream chunks to every connected viewer.
//!
//! Each chunk is delivered in one synchronous sweep. A viewer never blocks
//! the sweep: its frames go onto an unbounded channel and its backlog counter
//! decides whether it keeps receiving live chunks or is deferred until a
//! catch-up snapshot.

mod session;

pub use session::Flow;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use beach_pier_core::{ProcessStatus, ProtocolError, Seq, ServerMessage};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::serializer::Snapshot;
use session::{Completion, Offer, Request, ViewerSession};

/// Backlog thresholds, in bytes of serialized frames not yet written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLimits {
    pub high_water: usize,
    pub low_water: usize,
}

impl FlowLimits {
    pub const LOW_WATER_FLOOR: usize = 16 * 1024;

    /// Low water is half of high water, at least the floor, never above high.
    pub fn new(high_water: usize) -> Self {
        let low_water = (high_water / 2)
            .max(Self::LOW_WATER_FLOOR)
            .min(high_water);
        Self {
            high_water,
            low_water,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId {
    key: usize,
    serial: u64,
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.serial)
    }
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Arc<str>),
    Close,
}

/// One upstream chunk, serialized once as a `data` frame.
#[derive(Debug, Clone)]
pub struct LiveChunk {
    pub seq: Seq,
    pub frame: Arc<str>,
}

impl LiveChunk {
    pub fn new(seq: Seq, text: &str) -> Result<Self, ProtocolError> {
        let frame = ServerMessage::data(text, seq).to_text()?;
        Ok(Self {
            seq,
            frame: Arc::from(frame),
        })
    }
}

/// Read-only view of a session, used by snapshot predicates.
#[derive(Debug, Clone, Copy)]
pub struct ViewerInfo {
    pub id: ViewerId,
    pub flow: Flow,
    pub backlog: usize,
    pub last_snapshot_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub viewers: usize,
    pub deferred: usize,
}

#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    viewers: Mutex<Slab<ViewerSession>>,
    limits: FlowLimits,
    /// Only touched while `viewers` is held, so a status change and an
    /// attach can never miss each other.
    last_status: Mutex<Option<Arc<str>>>,
    recovery: mpsc::UnboundedSender<ViewerId>,
    next_serial: AtomicU64,
}

impl FanoutHub {
    /// The receiver yields viewers whose catch-up ticket was issued outside a
    /// snapshot request, and must be served by the resync coordinator.
    pub fn new(limits: FlowLimits) -> (Self, mpsc::UnboundedReceiver<ViewerId>) {
        let (recovery, recovery_rx) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(HubInner {
                viewers: Mutex::new(Slab::new()),
                limits,
                last_status: Mutex::new(None),
                recovery,
                next_serial: AtomicU64::new(1),
            }),
        };
        (hub, recovery_rx)
    }

    pub fn limits(&self) -> FlowLimits {
        self.inner.limits
    }

    /// Registers a viewer. The latest process status, if any, is queued first.
    pub fn attach(&self) -> ViewerInbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let session = ViewerSession::new(serial, tx, backlog.clone());

        let (id, connected) = {
            let mut viewers = self.inner.viewers.lock();
            if let Some(status) = self.inner.last_status.lock().clone() {
                session.send(status);
            }
            let key = viewers.insert(session);
            (ViewerId { key, serial }, viewers.len())
        };
        gauge!("beach_pier_viewers_connected", connected as f64);
        debug!(target: "pier::fanout", viewer = %id, connected, "viewer attached");

        ViewerInbox {
            id,
            rx,
            backlog,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn detach(&self, id: ViewerId) -> bool {
        let removed = {
            let mut viewers = self.inner.viewers.lock();
            let removed = remove_session(&mut viewers, id);
            if removed {
                publish_gauges(&viewers);
            }
            removed
        };
        if removed {
            debug!(target: "pier::fanout", viewer = %id, "viewer detached");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.viewers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HubStats {
        let viewers = self.inner.viewers.lock();
        HubStats {
            viewers: viewers.len(),
            deferred: count_deferred(&viewers),
        }
    }

    pub fn viewer(&self, id: ViewerId) -> Option<ViewerInfo> {
        let viewers = self.inner.viewers.lock();
        lookup(&viewers, id).map(|session| info_for(id, session))
    }

    pub fn broadcast_chunk(&self, chunk: &LiveChunk) {
        let mut sent = 0u64;
        let mut dropped = 0u64;
        let mut deferrals = 0u64;
        let mut recover = Vec::new();
        let mut closed = Vec::new();

        let mut viewers = self.inner.viewers.lock();
        for (key, session) in viewers.iter_mut() {
            let id = ViewerId {
                key,
                serial: session.serial,
            };
            match session.offer(chunk, self.inner.limits) {
                Offer::Sent => sent += 1,
                Offer::Held => {}
                Offer::Dropped => dropped += 1,
                Offer::Deferred => {
                    dropped += 1;
                    deferrals += 1;
                    info!(
                        target: "pier::fanout",
                        viewer = %id,
                        backlog = session.backlog(),
                        "viewer deferred; dropping live chunks"
                    );
                }
                Offer::Recover => {
                    dropped += 1;
                    recover.push(id);
                }
                Offer::Closed => closed.push(id),
            }
        }
        for id in &closed {
            remove_session(&mut viewers, *id);
        }
        if deferrals > 0 || !closed.is_empty() {
            publish_gauges(&viewers);
        }
        drop(viewers);

        if sent > 0 {
            counter!("beach_pier_chunks_fanned_out_total", sent);
        }
        if dropped > 0 {
            counter!("beach_pier_chunks_dropped_total", dropped);
        }
        if deferrals > 0 {
            counter!("beach_pier_deferrals_total", deferrals);
        }
        for id in recover {
            self.queue_recovery(id);
        }
    }

    /// Sends a status frame to every viewer, regardless of flow state, and
    /// remembers it for viewers that attach later.
    pub fn broadcast_status(&self, status: ProcessStatus) {
        let frame = match ServerMessage::Status(status).to_text() {
            Ok(frame) => Arc::<str>::from(frame),
            Err(err) => {
                warn!(target: "pier::fanout", error = %err, "failed to encode status frame");
                return;
            }
        };
        let mut viewers = self.inner.viewers.lock();
        *self.inner.last_status.lock() = Some(frame.clone());
        let closed: Vec<ViewerId> = viewers
            .iter()
            .filter(|(_, session)| !session.send(frame.clone()))
            .map(|(key, session)| ViewerId {
                key,
                serial: session.serial,
            })
            .collect();
        for id in closed {
            remove_session(&mut viewers, id);
        }
        publish_gauges(&viewers);
    }

    pub fn send_error(&self, id: ViewerId, message: impl Into<String>) {
        let frame = match (ServerMessage::Error {
            message: message.into(),
        })
        .to_text()
        {
            Ok(frame) => Arc::<str>::from(frame),
            Err(_) => return,
        };
        let viewers = self.inner.viewers.lock();
        if let Some(session) = lookup(&viewers, id) {
            session.send(frame);
        }
    }

    /// Opens a snapshot ticket for one viewer. Returns `false` when the
    /// request was folded into a ticket that is already outstanding.
    pub fn begin_snapshot(&self, id: ViewerId) -> bool {
        let mut viewers = self.inner.viewers.lock();
        let limits = self.inner.limits;
        match lookup_mut(&mut viewers, id).map(|session| session.request_snapshot(limits)) {
            Some(Request::Issued) => true,
            Some(Request::Coalesced) | Some(Request::Skipped) | None => false,
        }
    }

    /// Opens tickets for every viewer matching `predicate` and returns the
    /// viewers that now wait on a fresh snapshot.
    pub fn begin_snapshot_matching<P>(&self, predicate: P) -> Vec<ViewerId>
    where
        P: Fn(&ViewerInfo) -> bool,
    {
        let limits = self.inner.limits;
        let mut viewers = self.inner.viewers.lock();
        let mut issued = Vec::new();
        for (key, session) in viewers.iter_mut() {
            let id = ViewerId {
                key,
                serial: session.serial,
            };
            if !predicate(&info_for(id, session)) {
                continue;
            }
            if session.request_snapshot(limits) == Request::Issued {
                issued.push(id);
            }
        }
        issued
    }

    /// Delivers `snapshot` to each listed viewer that still holds a ticket.
    /// Returns how many viewers received it.
    pub fn complete_snapshot(&self, ids: &[ViewerId], snapshot: &Snapshot) -> usize {
        let message = ServerMessage::History {
            data: snapshot.text.clone(),
            seq: snapshot.seq,
        };
        let history = match message.to_text() {
            Ok(frame) => Arc::<str>::from(frame),
            Err(err) => {
                warn!(target: "pier::fanout", error = %err, "failed to encode history frame");
                self.fail_snapshot(ids);
                return 0;
            }
        };

        let mut delivered = 0usize;
        let mut retry = Vec::new();
        let mut viewers = self.inner.viewers.lock();
        for id in ids {
            let Some(session) = lookup_mut(&mut viewers, *id) else {
                continue;
            };
            match session.complete(&history, snapshot.seq) {
                Completion::Delivered { recovered } => {
                    delivered += 1;
                    if recovered {
                        info!(target: "pier::fanout", viewer = %id, "viewer caught up; resuming live delivery");
                    }
                }
                Completion::Stale => {
                    debug!(target: "pier::fanout", viewer = %id, "snapshot predates dropped chunks; retrying");
                    if session.try_recover(self.inner.limits) {
                        retry.push(*id);
                    }
                }
                Completion::NotPending => {}
                Completion::Closed => {
                    remove_session(&mut viewers, *id);
                }
            }
        }
        publish_gauges(&viewers);
        drop(viewers);

        if delivered > 0 {
            counter!("beach_pier_snapshots_delivered_total", delivered as u64);
        }
        for id in retry {
            self.queue_recovery(id);
        }
        delivered
    }

    pub fn fail_snapshot(&self, ids: &[ViewerId]) {
        let mut viewers = self.inner.viewers.lock();
        for id in ids {
            let released = match lookup_mut(&mut viewers, *id) {
                Some(session) => session.fail(),
                None => continue,
            };
            if !released {
                remove_session(&mut viewers, *id);
            }
        }
        publish_gauges(&viewers);
    }

    /// Sends a close to every viewer and forgets them.
    pub fn close_all(&self) -> usize {
        let mut viewers = self.inner.viewers.lock();
        for (_, session) in viewers.iter() {
            session.close();
        }
        let closed = viewers.len();
        viewers.clear();
        publish_gauges(&viewers);
        closed
    }

    fn queue_recovery(&self, id: ViewerId) {
        debug!(target: "pier::fanout", viewer = %id, "queueing catch-up snapshot");
        let _ = self.inner.recovery.send(id);
    }
}

impl HubInner {
    /// Called by a viewer's writer once its backlog drains to low water.
    fn nudge(&self, id: ViewerId) {
        let ready = {
            let mut viewers = self.viewers.lock();
            lookup_mut(&mut viewers, id).is_some_and(|session| session.try_recover(self.limits))
        };
        if ready {
            debug!(target: "pier::fanout", viewer = %id, "backlog drained; queueing catch-up snapshot");
            let _ = self.recovery.send(id);
        }
    }
}

/// Receiving half of a viewer registration. The socket writer pulls frames
/// from here and reports each completed write with [`ViewerInbox::mark_sent`].
pub struct ViewerInbox {
    id: ViewerId,
    rx: mpsc::UnboundedReceiver<Outbound>,
    backlog: Arc<AtomicUsize>,
    hub: Weak<HubInner>,
}

impl ViewerInbox {
    pub fn id(&self) -> ViewerId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn mark_sent(&self, bytes: usize) {
        let previous = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .unwrap_or(0);
        let current = previous.saturating_sub(bytes);
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        if previous > hub.limits.low_water && current <= hub.limits.low_water {
            hub.nudge(self.id);
        }
    }
}

fn lookup(viewers: &Slab<ViewerSession>, id: ViewerId) -> Option<&ViewerSession> {
    viewers
        .get(id.key)
        .filter(|session| session.serial == id.serial)
}

fn lookup_mut(viewers: &mut Slab<ViewerSession>, id: ViewerId) -> Option<&mut ViewerSession> {
    viewers
        .get_mut(id.key)
        .filter(|session| session.serial == id.serial)
}

fn remove_session(viewers: &mut Slab<ViewerSession>, id: ViewerId) -> bool {
    if lookup(viewers, id).is_none() {
        return false;
    }
    viewers.remove(id.key);
    true
}

fn info_for(id: ViewerId, session: &ViewerSession) -> ViewerInfo {
    ViewerInfo {
        id,
        flow: session.flow,
        backlog: session.backlog(),
        last_snapshot_at: session.last_snapshot_at,
    }
}

fn count_deferred(viewers: &Slab<ViewerSession>) -> usize {
    viewers
        .iter()
        .filter(|(_, session)| session.flow == Flow::Deferred)
        .count()
}

fn publish_gauges(viewers: &Slab<ViewerSession>) {
    gauge!("beach_pier_viewers_connected", viewers.len() as f64);
    gauge!("beach_pier_viewers_deferred", count_deferred(viewers) as f64);
}
