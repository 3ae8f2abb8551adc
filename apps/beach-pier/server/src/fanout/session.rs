use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use beach_pier_core::Seq;
use tokio::sync::mpsc;

use super::{FlowLimits, LiveChunk, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Deferred,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Offer {
    Sent,
    Held,
    Dropped,
    /// The chunk was dropped and the viewer just entered `Deferred`.
    Deferred,
    /// The chunk was dropped and the viewer is ready for its catch-up snapshot.
    Recover,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Request {
    Issued,
    Coalesced,
    /// Deferred with a full backlog; the recovery snapshot will cover it.
    Skipped,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Completion {
    Delivered { recovered: bool },
    /// Chunks newer than the snapshot were dropped; it cannot be used.
    Stale,
    NotPending,
    Closed,
}

/// Per-connection flow-control state.
///
/// While a snapshot is pending, live chunks are held instead of sent. Once
/// the snapshot with sequence `S` lands, the session sends it followed by the
/// held chunks newer than `S`, so the viewer sees no gap and no duplicate.
pub(super) struct ViewerSession {
    pub(super) serial: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    backlog: Arc<AtomicUsize>,
    pub(super) flow: Flow,
    snapshot_pending: bool,
    held: VecDeque<(Seq, Arc<str>)>,
    held_bytes: usize,
    dropped_through: Option<Seq>,
    pub(super) last_snapshot_at: Option<Instant>,
}

impl ViewerSession {
    pub(super) fn new(
        serial: u64,
        tx: mpsc::UnboundedSender<Outbound>,
        backlog: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            serial,
            tx,
            backlog,
            flow: Flow::Normal,
            snapshot_pending: false,
            held: VecDeque::new(),
            held_bytes: 0,
            dropped_through: None,
            last_snapshot_at: None,
        }
    }

    pub(super) fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    pub(super) fn is_snapshot_pending(&self) -> bool {
        self.snapshot_pending
    }

    pub(super) fn send(&self, frame: Arc<str>) -> bool {
        self.backlog.fetch_add(frame.len(), Ordering::AcqRel);
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub(super) fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub(super) fn offer(&mut self, chunk: &LiveChunk, limits: FlowLimits) -> Offer {
        match self.flow {
            Flow::Normal => {
                if self.backlog() > limits.high_water {
                    self.defer(chunk.seq);
                    return Offer::Deferred;
                }
                if self.snapshot_pending {
                    if self.held_bytes + chunk.frame.len() > limits.high_water {
                        self.defer(chunk.seq);
                        return Offer::Deferred;
                    }
                    self.hold(chunk);
                    return Offer::Held;
                }
                if self.send(chunk.frame.clone()) {
                    Offer::Sent
                } else {
                    Offer::Closed
                }
            }
            Flow::Deferred => {
                if self.snapshot_pending {
                    if self.held_bytes + chunk.frame.len() > limits.high_water {
                        self.discard_held();
                        self.note_dropped(chunk.seq);
                        return Offer::Dropped;
                    }
                    self.hold(chunk);
                    return Offer::Held;
                }
                self.note_dropped(chunk.seq);
                if self.try_recover(limits) {
                    Offer::Recover
                } else {
                    Offer::Dropped
                }
            }
        }
    }

    /// Issues the catch-up ticket for a deferred viewer whose backlog has
    /// drained to the low-water mark.
    pub(super) fn try_recover(&mut self, limits: FlowLimits) -> bool {
        if self.flow != Flow::Deferred || self.snapshot_pending {
            return false;
        }
        if self.backlog() > limits.low_water {
            return false;
        }
        self.snapshot_pending = true;
        true
    }

    pub(super) fn request_snapshot(&mut self, limits: FlowLimits) -> Request {
        if self.snapshot_pending {
            return Request::Coalesced;
        }
        let flow = self.flow;
        match flow {
            Flow::Normal => {
                self.snapshot_pending = true;
                Request::Issued
            }
            Flow::Deferred if self.try_recover(limits) => Request::Issued,
            Flow::Deferred => Request::Skipped,
        }
    }

    pub(super) fn complete(&mut self, history: &Arc<str>, seq: Option<Seq>) -> Completion {
        if !self.snapshot_pending {
            return Completion::NotPending;
        }
        self.snapshot_pending = false;

        let gap = match (self.dropped_through, seq) {
            (Some(dropped), Some(cut)) => dropped > cut,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if gap {
            self.flow = Flow::Deferred;
            self.discard_held();
            return Completion::Stale;
        }

        if !self.send(history.clone()) {
            return Completion::Closed;
        }
        for (chunk_seq, frame) in std::mem::take(&mut self.held) {
            if seq.is_some_and(|cut| chunk_seq <= cut) {
                continue;
            }
            if !self.send(frame) {
                return Completion::Closed;
            }
        }
        self.held_bytes = 0;
        self.dropped_through = None;
        self.last_snapshot_at = Some(Instant::now());
        let recovered = self.flow == Flow::Deferred;
        self.flow = Flow::Normal;
        Completion::Delivered { recovered }
    }

    /// A failed snapshot releases held chunks for a normal viewer. A deferred
    /// viewer stays deferred and is retried later.
    pub(super) fn fail(&mut self) -> bool {
        if !self.snapshot_pending {
            return true;
        }
        self.snapshot_pending = false;
        match self.flow {
            Flow::Normal => {
                self.held_bytes = 0;
                for (_, frame) in std::mem::take(&mut self.held) {
                    if !self.send(frame) {
                        return false;
                    }
                }
                true
            }
            Flow::Deferred => {
                self.discard_held();
                true
            }
        }
    }

    fn hold(&mut self, chunk: &LiveChunk) {
        self.held_bytes += chunk.frame.len();
        self.held.push_back((chunk.seq, chunk.frame.clone()));
    }

    fn defer(&mut self, seq: Seq) {
        self.flow = Flow::Deferred;
        self.discard_held();
        self.note_dropped(seq);
    }

    fn discard_held(&mut self) {
        if let Some((last, _)) = self.held.back() {
            let last = *last;
            self.note_dropped(last);
        }
        self.held.clear();
        self.held_bytes = 0;
    }

    fn note_dropped(&mut self, seq: Seq) {
        self.dropped_through = Some(self.dropped_through.map_or(seq, |prev| prev.max(seq)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ViewerSession, mpsc::UnboundedReceiver<Outbound>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        (ViewerSession::new(1, tx, backlog.clone()), rx, backlog)
    }

    fn chunk(seq: Seq, text: &str) -> LiveChunk {
        LiveChunk::new(seq, text).unwrap()
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(frame.to_string());
        }
        out
    }

    const LIMITS: FlowLimits = FlowLimits {
        high_water: 100,
        low_water: 50,
    };

    #[test_timeout::timeout]
    fn normal_viewer_receives_chunks_and_tracks_backlog() {
        let (mut session, mut rx, backlog) = session();
        let first = chunk(1, "A");
        assert_eq!(session.offer(&first, LIMITS), Offer::Sent);
        assert_eq!(backlog.load(Ordering::Acquire), first.frame.len());
        assert_eq!(frames(&mut rx), vec![first.frame.to_string()]);
    }

    #[test_timeout::timeout]
    fn held_chunks_older_than_the_snapshot_are_discarded() {
        let (mut session, mut rx, _) = session();
        assert_eq!(session.request_snapshot(LIMITS), Request::Issued);
        assert_eq!(session.request_snapshot(LIMITS), Request::Coalesced);
        assert_eq!(session.offer(&chunk(1, "A"), LIMITS), Offer::Held);
        assert_eq!(session.offer(&chunk(2, "B"), LIMITS), Offer::Held);

        let history: Arc<str> = Arc::from("history@1");
        assert_eq!(
            session.complete(&history, Some(1)),
            Completion::Delivered { recovered: false }
        );
        assert_eq!(
            frames(&mut rx),
            vec!["history@1".to_string(), chunk(2, "B").frame.to_string()]
        );
        assert_eq!(session.complete(&history, Some(1)), Completion::NotPending);
    }

    #[test_timeout::timeout]
    fn deferred_viewer_recovers_once_backlog_drains() {
        let (mut session, mut rx, backlog) = session();
        backlog.store(LIMITS.high_water + 1, Ordering::Release);
        assert_eq!(session.offer(&chunk(1, "C"), LIMITS), Offer::Deferred);
        assert_eq!(session.offer(&chunk(2, "D"), LIMITS), Offer::Dropped);
        assert!(frames(&mut rx).is_empty());

        backlog.store(LIMITS.low_water, Ordering::Release);
        assert!(session.try_recover(LIMITS));
        assert!(!session.try_recover(LIMITS));

        let history: Arc<str> = Arc::from("CD");
        assert_eq!(
            session.complete(&history, Some(2)),
            Completion::Delivered { recovered: true }
        );
        assert_eq!(session.flow, Flow::Normal);
        assert_eq!(frames(&mut rx), vec!["CD".to_string()]);
    }

    #[test_timeout::timeout]
    fn snapshot_older_than_a_dropped_chunk_is_stale() {
        let (mut session, mut rx, backlog) = session();
        assert_eq!(session.request_snapshot(LIMITS), Request::Issued);
        backlog.store(LIMITS.high_water + 1, Ordering::Release);
        assert_eq!(session.offer(&chunk(5, "late"), LIMITS), Offer::Deferred);

        let history: Arc<str> = Arc::from("cut@4");
        assert_eq!(session.complete(&history, Some(4)), Completion::Stale);
        assert_eq!(session.flow, Flow::Deferred);
        assert!(frames(&mut rx).is_empty());
    }

    #[test_timeout::timeout]
    fn failed_snapshot_releases_held_chunks_in_order() {
        let (mut session, mut rx, _) = session();
        session.request_snapshot(LIMITS);
        session.offer(&chunk(1, "A"), LIMITS);
        session.offer(&chunk(2, "B"), LIMITS);
        assert!(session.fail());
        assert_eq!(
            frames(&mut rx),
            vec![
                chunk(1, "A").frame.to_string(),
                chunk(2, "B").frame.to_string()
            ]
        );
        assert_eq!(session.offer(&chunk(3, "C"), LIMITS), Offer::Sent);
    }

    #[test_timeout::timeout]
    fn deferred_viewer_with_full_backlog_skips_requests() {
        let (mut session, _rx, backlog) = session();
        backlog.store(LIMITS.high_water + 1, Ordering::Release);
        session.offer(&chunk(1, "x"), LIMITS);
        assert_eq!(session.request_snapshot(LIMITS), Request::Skipped);
        backlog.store(0, Ordering::Release);
        assert_eq!(session.request_snapshot(LIMITS), Request::Issued);
    }
}
