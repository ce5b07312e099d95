//! Status dispatch
//!
//! Updates produced by the IO worker are delivered to their owners on a
//! separate task so that owner callbacks never run on the IO path. An
//! `IdleBarrier` counts updates that are queued but not yet delivered, which
//! is what cancellation waits on.

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};

use crate::transfer::request::UrlRequestIo;

/// Counter of undelivered updates that can be awaited until it drains
#[derive(Debug)]
pub struct IdleBarrier {
    pending: watch::Sender<usize>,
}

impl Default for IdleBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleBarrier {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self { pending }
    }

    pub fn enter(&self) {
        self.pending.send_modify(|n| *n += 1);
    }

    pub fn leave(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolve once nothing is pending
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

type Delivery<U> = (Arc<dyn UrlRequestIo<U>>, U);

/// Owns the status-dispatch task of one engine
pub struct StatusDispatcher<U: Send + 'static> {
    tx: mpsc::UnboundedSender<Delivery<U>>,
    barrier: Arc<IdleBarrier>,
    task: Mutex<Option<JoinHandle<()>>>,
    task_id: task::Id,
}

impl<U: Send + 'static> StatusDispatcher<U> {
    /// Spawn the dispatch task on the current runtime
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery<U>>();
        let barrier = Arc::new(IdleBarrier::new());
        let task_barrier = barrier.clone();
        let handle = tokio::spawn(async move {
            while let Some((io, update)) = rx.recv().await {
                io.url_request_update(update);
                task_barrier.leave();
            }
            debug!("Status dispatch task exiting");
        });
        let task_id = handle.id();
        Self {
            tx,
            barrier,
            task: Mutex::new(Some(handle)),
            task_id,
        }
    }

    /// Queue an update for delivery to `io`
    pub fn queue(&self, io: Arc<dyn UrlRequestIo<U>>, update: U) {
        self.barrier.enter();
        if self.tx.send((io, update)).is_err() {
            warn!("Status dispatch task is gone; dropping update");
            self.barrier.leave();
        }
    }

    /// Whether the caller is running on the dispatch task
    pub fn on_dispatch_task(&self) -> bool {
        task::try_id() == Some(self.task_id)
    }

    /// Wait until every queued update has been delivered
    ///
    /// Returns immediately when called from inside an owner callback, since
    /// the dispatch task cannot make progress while it waits on itself.
    pub async fn wait_idle(&self) {
        if self.on_dispatch_task() {
            return;
        }
        self.barrier.wait_idle().await;
    }

    pub fn barrier(&self) -> &IdleBarrier {
        &self.barrier
    }

    /// Stop delivering updates
    pub async fn shutdown(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl<U: Send + 'static> Drop for StatusDispatcher<U> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
