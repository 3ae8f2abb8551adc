//! Strict FIFO queue in front of the screen model.
//!
//! Jobs are enqueued synchronously when [`ModelSerializer::mutate`] is called,
//! not when the returned future is first polled. A snapshot therefore reflects
//! exactly the chunks submitted before it, whatever the caller does with the
//! future afterwards.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use beach_pier_core::Seq;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ModelError, ScreenError};
use crate::screen::ScreenModel;

/// A consistent rendering of the model, cut between two chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub text: String,
    /// Last chunk the model reflected, `None` if nothing was applied yet.
    pub seq: Option<Seq>,
}

/// The screen model plus the sequence number of the last chunk fed into it.
pub struct MirroredScreen {
    model: Box<dyn ScreenModel>,
    applied: Option<Seq>,
}

impl MirroredScreen {
    pub fn new(model: Box<dyn ScreenModel>) -> Self {
        Self {
            model,
            applied: None,
        }
    }

    pub fn reset(&mut self, cols: u16, rows: u16) {
        self.model.reset(cols, rows);
    }

    pub fn apply(&mut self, seq: Seq, bytes: &[u8]) {
        self.model.write(bytes);
        self.applied = Some(seq);
    }

    pub fn snapshot(&self) -> Result<Snapshot, ScreenError> {
        Ok(Snapshot {
            text: self.model.serialize()?,
            seq: self.applied,
        })
    }

    pub fn dispose(mut self) {
        self.model.dispose();
    }
}

type Job = Box<dyn FnOnce(&mut MirroredScreen) + Send>;

pub struct ModelSerializer {
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<MirroredScreen>>>,
}

impl ModelSerializer {
    pub fn spawn(screen: MirroredScreen) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_queue(rx, screen));
        Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues `task` behind everything submitted so far. Dropping the
    /// returned future does not cancel the task.
    pub fn mutate<R, F>(&self, task: F) -> impl Future<Output = Result<R, ModelError>> + Send
    where
        F: FnOnce(&mut MirroredScreen) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |screen| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(screen)))
                .map_err(|payload| {
                    let message = panic_message(payload.as_ref());
                    warn!(target: "pier::serializer", %message, "model task panicked");
                    ModelError::Panicked(message)
                });
            let _ = reply_tx.send(outcome);
        });
        let queued = self.enqueue(job);
        async move {
            queued?;
            reply_rx.await.map_err(|_| ModelError::Closed)?
        }
    }

    pub fn apply(
        &self,
        seq: Seq,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), ModelError>> + Send {
        self.mutate(move |screen| screen.apply(seq, &bytes))
    }

    /// Queues a live chunk without waiting on it. Failures are logged by the
    /// worker.
    pub fn mirror(&self, seq: Seq, bytes: Vec<u8>) {
        let job: Job = Box::new(move |screen| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| screen.apply(seq, &bytes)));
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                warn!(target: "pier::serializer", seq, %message, "mirroring chunk panicked");
            }
        });
        if self.enqueue(job).is_err() {
            debug!(target: "pier::serializer", seq, "model queue closed; chunk not mirrored");
        }
    }

    pub fn reset(&self, cols: u16, rows: u16) -> impl Future<Output = Result<(), ModelError>> + Send {
        self.mutate(move |screen| screen.reset(cols, rows))
    }

    pub fn snapshot(&self) -> impl Future<Output = Result<Snapshot, ModelError>> + Send {
        let reply = self.mutate(|screen| screen.snapshot());
        async move { reply.await?.map_err(ModelError::from) }
    }

    /// Stops accepting work, lets queued jobs finish, and hands the screen
    /// back. Returns `None` if already closed.
    pub async fn close(&self) -> Option<MirroredScreen> {
        drop(self.queue.lock().take());
        let worker = self.worker.lock().take()?;
        match worker.await {
            Ok(screen) => Some(screen),
            Err(err) => {
                warn!(target: "pier::serializer", error = %err, "model worker ended abnormally");
                None
            }
        }
    }

    fn enqueue(&self, job: Job) -> Result<(), ModelError> {
        let queue = self.queue.lock();
        let sender = queue.as_ref().ok_or(ModelError::Closed)?;
        sender.send(job).map_err(|_| ModelError::Closed)
    }
}

async fn run_queue(mut rx: mpsc::UnboundedReceiver<Job>, mut screen: MirroredScreen) -> MirroredScreen {
    while let Some(job) = rx.recv().await {
        job(&mut screen);
    }
    debug!(target: "pier::serializer", "model queue drained");
    screen
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::{RecordingScreen, ScreenCall};

    fn serializer() -> (ModelSerializer, RecordingScreen) {
        let screen = RecordingScreen::new();
        let serializer = ModelSerializer::spawn(MirroredScreen::new(Box::new(screen.clone())));
        (serializer, screen)
    }

    #[test_timeout::tokio_timeout_test]
    async fn snapshot_reflects_only_earlier_chunks() {
        let (serializer, _screen) = serializer();
        serializer.mirror(1, b"A".to_vec());
        let first = serializer.snapshot();
        serializer.mirror(2, b"B".to_vec());
        let second = serializer.snapshot();

        assert_eq!(
            first.await.unwrap(),
            Snapshot {
                text: "A".into(),
                seq: Some(1)
            }
        );
        assert_eq!(
            second.await.unwrap(),
            Snapshot {
                text: "AB".into(),
                seq: Some(2)
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn panicking_task_does_not_stop_the_queue() {
        let (serializer, screen) = serializer();
        screen.panic_on_write(b"boom");

        let failed = serializer.apply(1, b"boom".to_vec()).await;
        assert!(matches!(failed, Err(ModelError::Panicked(_))));

        serializer.apply(2, b"ok".to_vec()).await.unwrap();
        let snapshot = serializer.snapshot().await.unwrap();
        assert_eq!(snapshot.text, "ok");
        assert_eq!(snapshot.seq, Some(2));
    }

    #[test_timeout::tokio_timeout_test]
    async fn serialize_failure_is_reported_to_the_caller_only() {
        let (serializer, screen) = serializer();
        screen.fail_serializes(1);
        serializer.mirror(1, b"x".to_vec());

        let err = serializer.snapshot().await.unwrap_err();
        assert!(matches!(err, ModelError::Task(ScreenError::Failed(_))));
        assert_eq!(serializer.snapshot().await.unwrap().text, "x");
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_drains_queued_work_before_returning() {
        let (serializer, screen) = serializer();
        serializer.reset(80, 24).await.unwrap();
        serializer.mirror(1, b"A".to_vec());
        serializer.mirror(2, b"B".to_vec());

        let mirrored = serializer.close().await.expect("screen returned");
        assert_eq!(screen.text(), "AB");
        assert!(!screen.is_disposed());
        mirrored.dispose();
        assert_eq!(
            screen.calls(),
            vec![
                ScreenCall::Reset { cols: 80, rows: 24 },
                ScreenCall::Write(b"A".to_vec()),
                ScreenCall::Write(b"B".to_vec()),
                ScreenCall::Dispose,
            ]
        );

        assert_eq!(serializer.snapshot().await, Err(ModelError::Closed));
        assert!(serializer.close().await.is_none());
    }
}
