//! Multiplexed transfer engine
//!
//! `UrlRequestManager` runs any number of `UrlRequest`s concurrently on one
//! IO task. Jobs move through three tables:
//!
//! * not started: created by `init_request`, waiting for `start_transfer`
//! * queued: started, waiting for the IO task to pick them up
//! * current: running inside the IO task's `JoinSet`
//!
//! Completed jobs produce exactly one terminal update, delivered through the
//! status dispatcher unless the owner cancelled the job in the meantime.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::{self, JoinHandle, JoinSet};

use crate::error::handlers::{log_transport_error, status_for_transport_error};
use crate::error::{TransferError, TransportError, TransportErrorKind};
use crate::storage::{FileIoProvider, FileWriter, LocalFileIoProvider};
use crate::transfer::dispatch::StatusDispatcher;
use crate::transfer::request::{RequestOptions, TransferKind, UrlRequest, UrlRequestIo};
use crate::transfer::status::{FileIoStatus, TransferUpdate};
use crate::transport::{
    Exchange, NetTransport, TransferLimits, TransferSink, Transport, UploadSource,
};

/// How long the IO task sleeps when nothing happens
pub const IO_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub limits: TransferLimits,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: TransferLimits::default(),
            poll_interval: IO_POLL_INTERVAL,
        }
    }
}

/// Cancellation slot shared between the tables and a running job
///
/// Clearing the slot is how a job is cancelled once it is running; nothing is
/// delivered for a job whose slot is empty.
pub struct OwnerSlot<U> {
    io: Mutex<Option<Arc<dyn UrlRequestIo<U>>>>,
}

impl<U> OwnerSlot<U> {
    fn new(io: Arc<dyn UrlRequestIo<U>>) -> Self {
        Self {
            io: Mutex::new(Some(io)),
        }
    }

    /// Queue the update built by `make` unless the slot has been cleared
    ///
    /// The slot stays locked until the update is queued, so once `clear`
    /// returns every delivery that got past the check is visible to the
    /// dispatcher's idle barrier.
    pub fn deliver(&self, dispatcher: &StatusDispatcher<U>, make: impl FnOnce() -> U) -> bool
    where
        U: Send + 'static,
    {
        let io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        match io.as_ref() {
            Some(io) => {
                dispatcher.queue(io.clone(), make());
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.io.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// One request bound to the engine
struct IoJob<R: UrlRequest> {
    id: i32,
    owner: u64,
    request: R,
    slot: Arc<OwnerSlot<R::Update>>,
}

/// Bookkeeping for a job inside the IO task
struct RunningJob<U> {
    owner: u64,
    slot: Arc<OwnerSlot<U>>,
}

struct JobTables<R: UrlRequest> {
    not_running: HashMap<i32, IoJob<R>>,
    queued: VecDeque<IoJob<R>>,
    current: HashMap<i32, RunningJob<R::Update>>,
}

/// Result of driving one job
struct JobOutcome<R: UrlRequest> {
    job: IoJob<R>,
    result: Result<u32, (FileIoStatus, String)>,
    transferred: u64,
    total: u64,
}

struct Shared<R: UrlRequest> {
    config: EngineConfig,
    next_id: AtomicI32,
    tables: Mutex<JobTables<R>>,
    wake: Notify,
    dispatcher: StatusDispatcher<R::Update>,
    transport: Arc<dyn Transport>,
    provider: Arc<dyn FileIoProvider>,
}

impl<R: UrlRequest> Shared<R> {
    fn tables(&self) -> MutexGuard<'_, JobTables<R>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit the terminal update for a finished job and forget it
    ///
    /// The job leaves `current` only after its update is queued.
    fn complete(&self, outcome: JobOutcome<R>) {
        let JobOutcome {
            mut job,
            result,
            transferred,
            total,
        } = outcome;

        let (status, detail) = match result {
            Ok(code) => (job.request.status_for_response(code), None),
            Err((status, detail)) => (status, Some(detail)),
        };
        info!(
            "Transfer {} {} - status {} ({}); transferred {} of {}",
            job.id,
            if status == FileIoStatus::Success {
                "succeeded"
            } else {
                "failed"
            },
            status,
            detail.as_deref().unwrap_or(""),
            transferred,
            total
        );

        let id = job.id;
        let request = &mut job.request;
        let delivered = job.slot.deliver(&self.dispatcher, || {
            request.create_update(TransferUpdate::new(id, status, detail, transferred, total))
        });
        if !delivered {
            debug!("Transfer {} was cancelled; discarding result", id);
        }
        self.tables().current.remove(&id);
    }
}

/// Generic transfer engine
pub struct UrlRequestManager<R: UrlRequest> {
    shared: Arc<Shared<R>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: UrlRequest> UrlRequestManager<R> {
    /// Engine over the network transports and local files
    pub fn new() -> Self {
        Self::with_parts(
            EngineConfig::default(),
            Arc::new(NetTransport::new()),
            Arc::new(LocalFileIoProvider),
        )
    }

    /// Engine with an explicit transport and file provider
    pub fn with_parts(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn FileIoProvider>,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            next_id: AtomicI32::new(0),
            tables: Mutex::new(JobTables {
                not_running: HashMap::new(),
                queued: VecDeque::new(),
                current: HashMap::new(),
            }),
            wake: Notify::new(),
            dispatcher: StatusDispatcher::spawn(),
            transport,
            provider,
        });
        let io_task = tokio::spawn(io_loop(shared.clone()));
        Self {
            shared,
            io_task: Mutex::new(Some(io_task)),
        }
    }

    /// Register a request without starting it
    ///
    /// # Arguments
    /// * `owner` - Identity used by `cancel_all`
    /// * `io` - Receiver of every update for this request
    /// * `request` - The request itself
    ///
    /// # Returns
    /// The transfer id to pass to `start_transfer` and `cancel`
    pub fn init_request(&self, owner: u64, io: Arc<dyn UrlRequestIo<R::Update>>, request: R) -> i32 {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let target = request.target();
        debug!(
            "Transfer {} created: {:?} {} local {}",
            id,
            target.kind,
            target.url,
            target
                .local_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "mem".to_string())
        );
        let job = IoJob {
            id,
            owner,
            request,
            slot: Arc::new(OwnerSlot::new(io)),
        };
        self.shared.tables().not_running.insert(id, job);
        id
    }

    /// Hand a registered request to the IO task
    pub fn start_transfer(&self, id: i32) -> Result<(), TransferError> {
        self.start_if(id, None)
    }

    /// Like `start_transfer`, but only for a request registered by `owner`
    pub fn start_owned_transfer(&self, owner: u64, id: i32) -> Result<(), TransferError> {
        self.start_if(id, Some(owner))
    }

    fn start_if(&self, id: i32, owner: Option<u64>) -> Result<(), TransferError> {
        {
            let mut tables = self.shared.tables();
            let job = tables
                .not_running
                .remove(&id)
                .ok_or_else(|| TransferError::IllegalArgument(format!("unknown transfer id {}", id)))?;
            if owner.is_some_and(|owner| owner != job.owner) {
                tables.not_running.insert(id, job);
                return Err(TransferError::IllegalArgument(format!("unknown transfer id {}", id)));
            }
            tables.queued.push_back(job);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Cancel one transfer
    ///
    /// A job that has not been handed to the IO task is removed outright. A
    /// running job keeps running but its result is discarded. No update for
    /// the job is delivered once this returns.
    pub async fn cancel(&self, id: i32) {
        self.cancel_if(id, None).await;
    }

    /// Like `cancel`, but leaves requests registered by other owners alone
    pub async fn cancel_owned(&self, owner: u64, id: i32) {
        self.cancel_if(id, Some(owner)).await;
    }

    async fn cancel_if(&self, id: i32, owner: Option<u64>) {
        let owned = |job_owner: u64| owner.is_none_or(|owner| owner == job_owner);
        let slot = {
            let mut tables = self.shared.tables();
            if tables.not_running.get(&id).is_some_and(|job| owned(job.owner)) {
                tables.not_running.remove(&id);
                debug!("Transfer {} cancelled before start", id);
                return;
            }
            if let Some(pos) = tables
                .queued
                .iter()
                .position(|job| job.id == id && owned(job.owner))
            {
                tables.queued.remove(pos);
                debug!("Transfer {} cancelled while queued", id);
                return;
            }
            tables
                .current
                .get(&id)
                .filter(|running| owned(running.owner))
                .map(|running| running.slot.clone())
        };
        if let Some(slot) = slot {
            debug!("Transfer {} cancelled while running", id);
            slot.clear();
        }
        self.shared.dispatcher.wait_idle().await;
    }

    /// Cancel every transfer owned by `owner`
    pub async fn cancel_all(&self, owner: u64) {
        {
            let mut tables = self.shared.tables();
            tables.not_running.retain(|_, job| job.owner != owner);
            tables.queued.retain(|job| job.owner != owner);
            for running in tables.current.values().filter(|r| r.owner == owner) {
                running.slot.clear();
            }
        }
        self.shared.dispatcher.wait_idle().await;
    }

    /// Number of transfers known to the engine in any state
    pub fn active_count(&self) -> usize {
        let tables = self.shared.tables();
        tables.not_running.len() + tables.queued.len() + tables.current.len()
    }

    /// Stop the IO and dispatch tasks
    pub async fn shutdown(&self) {
        let handle = self
            .io_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.dispatcher.shutdown().await;
    }
}

impl<R: UrlRequest> Default for UrlRequestManager<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: UrlRequest> Drop for UrlRequestManager<R> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .io_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// IO task: picks up queued jobs and reaps finished ones
async fn io_loop<R: UrlRequest>(shared: Arc<Shared<R>>) {
    let mut pool: JoinSet<JobOutcome<R>> = JoinSet::new();
    let mut task_ids: HashMap<task::Id, i32> = HashMap::new();

    loop {
        tokio::select! {
            _ = shared.wake.notified() => {}
            Some(joined) = pool.join_next_with_id(), if !pool.is_empty() => {
                reap(&shared, &mut task_ids, joined);
            }
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
        }

        // Always perform after waking, even if nothing reported ready
        let fresh: Vec<IoJob<R>> = {
            let mut tables = shared.tables();
            let fresh: Vec<IoJob<R>> = tables.queued.drain(..).collect();
            for job in &fresh {
                tables.current.insert(
                    job.id,
                    RunningJob {
                        owner: job.owner,
                        slot: job.slot.clone(),
                    },
                );
            }
            fresh
        };
        for job in fresh {
            let id = job.id;
            let handle = pool.spawn(run_job(shared.clone(), job));
            task_ids.insert(handle.id(), id);
        }

        while let Some(joined) = pool.try_join_next_with_id() {
            reap(&shared, &mut task_ids, joined);
        }
    }
}

fn reap<R: UrlRequest>(
    shared: &Shared<R>,
    task_ids: &mut HashMap<task::Id, i32>,
    joined: Result<(task::Id, JobOutcome<R>), task::JoinError>,
) {
    match joined {
        Ok((task_id, outcome)) => {
            task_ids.remove(&task_id);
            shared.complete(outcome);
        }
        Err(e) => {
            let id = task_ids.remove(&e.id());
            error!("Transfer task {:?} died: {}", id, e);
            if let Some(id) = id {
                shared.tables().current.remove(&id);
            }
        }
    }
}

/// Drive one job through the transport
async fn run_job<R: UrlRequest>(shared: Arc<Shared<R>>, mut job: IoJob<R>) -> JobOutcome<R> {
    let target = job.request.target().clone();
    debug!(
        "Transfer {} initiating {} of {}",
        job.id,
        if target.kind.is_upload() { "upload" } else { "download" },
        target.url
    );

    let mut upload = None;
    let mut writer = None;
    let mut total = 0;
    match (target.kind, target.local_file.as_deref()) {
        (TransferKind::FileUpload, path) => match open_upload(shared.provider.as_ref(), path).await {
            Ok(source) => {
                total = source.len;
                upload = Some(source);
            }
            Err(detail) => return local_failure(job, detail),
        },
        (TransferKind::FileDownload, path) => match open_download(shared.provider.as_ref(), path).await {
            Ok(file) => writer = Some(file),
            Err(detail) => return local_failure(job, detail),
        },
        (TransferKind::BufferDownload, _) => {}
    }

    let mut options = RequestOptions::default();
    job.request.configure(&mut options);
    let exchange = Exchange {
        url: target.url.clone(),
        kind: target.kind,
        options,
        tls: target.tls.clone(),
        upload,
        limits: shared.config.limits,
    };

    let mut sink = JobSink {
        id: job.id,
        request: &mut job.request,
        writer: writer.as_mut(),
        slot: &job.slot,
        dispatcher: &shared.dispatcher,
        transferred: 0,
        total,
    };
    let mut result = shared.transport.perform(exchange, &mut sink).await;
    let (transferred, total) = (sink.transferred, sink.total);

    if let Some(mut file) = writer {
        if let Err(e) = file.shutdown().await {
            if result.is_ok() {
                result = Err(TransportError::new(TransportErrorKind::WriteError, e.to_string()));
            }
        }
    }

    let result = result.map_err(|err| {
        log_transport_error(job.id, &err);
        (status_for_transport_error(&err), err.detail)
    });
    JobOutcome {
        job,
        result,
        transferred,
        total,
    }
}

async fn open_upload(provider: &dyn FileIoProvider, path: Option<&Path>) -> Result<UploadSource, String> {
    let path = path.ok_or_else(|| "Could not open file - check path and permissions".to_string())?;
    let len = provider
        .size(path)
        .await
        .map_err(|_| "Could not determine file size - check path and permissions".to_string())?;
    let reader = provider
        .open_read(path)
        .await
        .map_err(|_| "Could not open file - check path and permissions".to_string())?;
    Ok(UploadSource { reader, len })
}

async fn open_download(provider: &dyn FileIoProvider, path: Option<&Path>) -> Result<FileWriter, String> {
    let path = path.ok_or_else(|| "Could not open file - check path and permissions".to_string())?;
    provider
        .open_write(path)
        .await
        .map_err(|_| "Could not open file - check path and permissions".to_string())
}

fn local_failure<R: UrlRequest>(job: IoJob<R>, detail: String) -> JobOutcome<R> {
    JobOutcome {
        job,
        result: Err((FileIoStatus::LocalFileOpenFailure, detail)),
        transferred: 0,
        total: 0,
    }
}

/// Sink that routes transport data into the job
struct JobSink<'a, R: UrlRequest> {
    id: i32,
    request: &'a mut R,
    writer: Option<&'a mut FileWriter>,
    slot: &'a OwnerSlot<R::Update>,
    dispatcher: &'a StatusDispatcher<R::Update>,
    transferred: u64,
    total: u64,
}

#[async_trait]
impl<R: UrlRequest> TransferSink for JobSink<'_, R> {
    async fn data(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        match self.writer.as_mut() {
            Some(file) => file
                .write_all(chunk)
                .await
                .map_err(|e| TransportError::new(TransportErrorKind::WriteError, e.to_string())),
            None => {
                self.request.downloaded_data(chunk);
                Ok(())
            }
        }
    }

    fn progress(&mut self, transferred: u64, total: u64) {
        if total > 0 {
            self.total = total;
        }
        if transferred == self.transferred {
            return;
        }
        self.transferred = transferred;
        let (id, total) = (self.id, self.total);
        let request = &mut *self.request;
        self.slot.deliver(self.dispatcher, || {
            request.create_update(TransferUpdate::new(
                id,
                FileIoStatus::InProgress,
                None,
                transferred,
                total,
            ))
        });
    }
}
