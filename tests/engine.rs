use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use commo_transfer::error::{TransferError, TransportError, TransportErrorKind};
use commo_transfer::storage::{FileIoProvider, LocalFileIoProvider};
use commo_transfer::transfer::{
    EngineConfig, FileIoStatus, RequestTarget, SimpleFileIo, SimpleFileIoManager,
    SimpleFileIoUpdate, TransferKind, TransferUpdate, UrlRequest, UrlRequestIo, UrlRequestManager,
};
use commo_transfer::transport::tls::TlsSettings;
use commo_transfer::transport::{Exchange, TransferSink, Transport};
use commo_transfer::utils::logging::setup_test_logging;

const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// What the scripted transport does for every exchange
#[derive(Clone)]
enum Script {
    Respond { code: u32, body: Vec<u8> },
    Fail(TransportErrorKind, &'static str),
}

struct ScriptedTransport {
    script: Script,
    entered: Arc<Notify>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedTransport {
    fn new(script: Script) -> Self {
        Self {
            script,
            entered: Arc::new(Notify::new()),
            gate: None,
        }
    }

    fn gated(script: Script, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(script)
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn perform(
        &self,
        exchange: Exchange,
        sink: &mut dyn TransferSink,
    ) -> Result<u32, TransportError> {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.script {
            Script::Respond { code, body } => {
                if !exchange.kind.is_upload() {
                    sink.data(body).await?;
                }
                sink.progress(body.len() as u64, body.len() as u64);
                Ok(*code)
            }
            Script::Fail(kind, detail) => Err(TransportError::new(*kind, *detail)),
        }
    }
}

#[derive(Debug)]
struct TestUpdate {
    base: TransferUpdate,
    body: Vec<u8>,
}

struct TestRequest {
    target: RequestTarget,
    body: Vec<u8>,
}

impl TestRequest {
    fn buffer(url: &str) -> Self {
        Self {
            target: RequestTarget::new(url, TransferKind::BufferDownload, TlsSettings::accept_any()),
            body: Vec::new(),
        }
    }
}

impl UrlRequest for TestRequest {
    type Update = TestUpdate;

    fn target(&self) -> &RequestTarget {
        &self.target
    }

    fn status_for_response(&self, code: u32) -> FileIoStatus {
        if code == 200 {
            FileIoStatus::Success
        } else {
            FileIoStatus::OtherError
        }
    }

    fn downloaded_data(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    fn create_update(&mut self, base: TransferUpdate) -> TestUpdate {
        let body = if base.status.is_terminal() {
            std::mem::take(&mut self.body)
        } else {
            Vec::new()
        };
        TestUpdate { base, body }
    }
}

struct Recorder {
    updates: Mutex<Vec<TestUpdate>>,
    terminal: mpsc::UnboundedSender<i32>,
}

impl UrlRequestIo<TestUpdate> for Recorder {
    fn url_request_update(&self, update: TestUpdate) {
        if update.base.status.is_terminal() {
            let _ = self.terminal.send(update.base.xfer_id);
        }
        self.updates.lock().unwrap().push(update);
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<i32>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder {
        updates: Mutex::new(Vec::new()),
        terminal: tx,
    });
    (recorder, rx)
}

fn engine(transport: ScriptedTransport) -> UrlRequestManager<TestRequest> {
    UrlRequestManager::with_parts(
        EngineConfig::default(),
        Arc::new(transport),
        Arc::new(LocalFileIoProvider),
    )
}

fn terminal_updates(recorder: &Recorder, id: i32) -> usize {
    recorder
        .updates
        .lock()
        .unwrap()
        .iter()
        .filter(|u| u.base.xfer_id == id && u.base.status.is_terminal())
        .count()
}

#[tokio::test]
async fn test_buffer_download_delivers_one_terminal_update() {
    setup_test_logging();
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 200,
        body: b"listing".to_vec(),
    }));
    let (recorder, mut done) = recorder();

    let id = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/list"));
    engine.start_transfer(id).unwrap();
    assert_eq!(done.recv().await, Some(id));
    tokio::time::sleep(QUIET_PERIOD).await;

    assert_eq!(terminal_updates(&recorder, id), 1);
    let updates = recorder.updates.lock().unwrap();
    let last = updates.last().unwrap();
    assert_eq!(last.base.status, FileIoStatus::Success);
    assert_eq!(last.body, b"listing");
    assert_eq!(last.base.bytes_transferred, 7);
    drop(updates);
    assert_eq!(engine.active_count(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_response_code_is_refined_by_request() {
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 500,
        body: Vec::new(),
    }));
    let (recorder, mut done) = recorder();

    let id = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/x"));
    engine.start_transfer(id).unwrap();
    done.recv().await;

    let updates = recorder.updates.lock().unwrap();
    assert_eq!(updates.last().unwrap().base.status, FileIoStatus::OtherError);
}

#[tokio::test]
async fn test_transport_failure_maps_to_status() {
    let engine = engine(ScriptedTransport::new(Script::Fail(
        TransportErrorKind::Connect,
        "Failed to connect",
    )));
    let (recorder, mut done) = recorder();

    let id = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/x"));
    engine.start_transfer(id).unwrap();
    done.recv().await;

    let updates = recorder.updates.lock().unwrap();
    let last = updates.last().unwrap();
    assert_eq!(last.base.status, FileIoStatus::ConnectFail);
    assert_eq!(last.base.additional_info.as_deref(), Some("Failed to connect"));
}

#[tokio::test]
async fn test_unknown_id_cannot_start() {
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 200,
        body: Vec::new(),
    }));
    assert!(matches!(
        engine.start_transfer(42),
        Err(TransferError::IllegalArgument(_))
    ));
}

#[tokio::test]
async fn test_cancel_before_start_is_silent() {
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 200,
        body: Vec::new(),
    }));
    let (recorder, _done) = recorder();

    let id = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/x"));
    engine.cancel(id).await;
    assert!(engine.start_transfer(id).is_err());
    tokio::time::sleep(QUIET_PERIOD).await;

    assert!(recorder.updates.lock().unwrap().is_empty());
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test]
async fn test_cancel_in_flight_discards_result() {
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::gated(
        Script::Respond {
            code: 200,
            body: b"late".to_vec(),
        },
        gate.clone(),
    );
    let entered = transport.entered.clone();
    let engine = engine(transport);
    let (recorder, _done) = recorder();

    let id = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/x"));
    engine.start_transfer(id).unwrap();
    entered.notified().await;

    engine.cancel(id).await;
    gate.notify_one();
    tokio::time::sleep(QUIET_PERIOD).await;

    assert!(recorder.updates.lock().unwrap().is_empty());
}

/// Reports progress in small steps before answering 200
struct SteppingTransport {
    steps: u64,
    finished: Arc<Notify>,
}

#[async_trait]
impl Transport for SteppingTransport {
    async fn perform(
        &self,
        _exchange: Exchange,
        sink: &mut dyn TransferSink,
    ) -> Result<u32, TransportError> {
        for step in 1..=self.steps {
            sink.progress(step, self.steps);
        }
        self.finished.notify_one();
        Ok(200)
    }
}

/// Slow owner that counts what reaches it after `cancel` returned
struct SlowRecorder {
    cancelled: AtomicBool,
    late: AtomicUsize,
}

impl UrlRequestIo<TestUpdate> for SlowRecorder {
    fn url_request_update(&self, _update: TestUpdate) {
        std::thread::sleep(Duration::from_millis(40));
        if self.cancelled.load(Ordering::SeqCst) {
            self.late.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_waits_out_backlog_of_finished_job() {
    let finished = Arc::new(Notify::new());
    let engine: UrlRequestManager<TestRequest> = UrlRequestManager::with_parts(
        EngineConfig::default(),
        Arc::new(SteppingTransport {
            steps: 10,
            finished: finished.clone(),
        }),
        Arc::new(LocalFileIoProvider),
    );
    let recorder = Arc::new(SlowRecorder {
        cancelled: AtomicBool::new(false),
        late: AtomicUsize::new(0),
    });

    let id = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/x"));
    engine.start_transfer(id).unwrap();
    finished.notified().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.cancel(id).await;
    recorder.cancelled.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(recorder.late.load(Ordering::SeqCst), 0);
    assert_eq!(engine.active_count(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_owned_start_and_cancel_ignore_other_owners() {
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 200,
        body: Vec::new(),
    }));
    let (recorder, mut done) = recorder();

    let id = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/a"));
    assert!(matches!(
        engine.start_owned_transfer(2, id),
        Err(TransferError::IllegalArgument(_))
    ));
    engine.cancel_owned(2, id).await;
    assert_eq!(engine.active_count(), 1);

    engine.start_owned_transfer(1, id).unwrap();
    assert_eq!(done.recv().await, Some(id));
}

#[tokio::test]
async fn test_cancel_all_only_touches_owner() {
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 200,
        body: Vec::new(),
    }));
    let (recorder, mut done) = recorder();

    let dropped = engine.init_request(1, recorder.clone(), TestRequest::buffer("http://server/a"));
    let kept = engine.init_request(2, recorder.clone(), TestRequest::buffer("http://server/b"));
    engine.cancel_all(1).await;

    assert!(engine.start_transfer(dropped).is_err());
    engine.start_transfer(kept).unwrap();
    assert_eq!(done.recv().await, Some(kept));
    assert_eq!(terminal_updates(&recorder, dropped), 0);
}

#[tokio::test]
async fn test_file_download_writes_through_provider() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 200,
        body: b"payload".to_vec(),
    }));
    let (recorder, mut done) = recorder();

    let request = TestRequest {
        target: RequestTarget::new(
            "http://server/file",
            TransferKind::FileDownload,
            TlsSettings::accept_any(),
        )
        .with_local_file(&path),
        body: Vec::new(),
    };
    let id = engine.init_request(1, recorder.clone(), request);
    engine.start_transfer(id).unwrap();
    done.recv().await;

    assert_eq!(std::fs::read(&path).unwrap(), b"payload");
}

#[tokio::test]
async fn test_missing_upload_source_is_local_failure() {
    let engine = engine(ScriptedTransport::new(Script::Respond {
        code: 200,
        body: Vec::new(),
    }));
    let (recorder, mut done) = recorder();

    let request = TestRequest {
        target: RequestTarget::new(
            "http://server/file",
            TransferKind::FileUpload,
            TlsSettings::accept_any(),
        )
        .with_local_file("/nonexistent/commo/file.zip"),
        body: Vec::new(),
    };
    let id = engine.init_request(1, recorder.clone(), request);
    engine.start_transfer(id).unwrap();
    done.recv().await;

    let updates = recorder.updates.lock().unwrap();
    assert_eq!(
        updates.last().unwrap().base.status,
        FileIoStatus::LocalFileOpenFailure
    );
}

struct SimpleRecorder(mpsc::UnboundedSender<SimpleFileIoUpdate>);

impl SimpleFileIo for SimpleRecorder {
    fn file_transfer_update(&self, update: SimpleFileIoUpdate) {
        let _ = self.0.send(update);
    }
}

#[tokio::test]
async fn test_simple_upload_reports_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("up.txt");
    std::fs::write(&path, b"hello").unwrap();
    assert_eq!(LocalFileIoProvider.size(Path::new(&path)).await.unwrap(), 5);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = SimpleFileIoManager::with_parts(
        Arc::new(SimpleRecorder(tx)),
        EngineConfig::default(),
        Arc::new(ScriptedTransport::new(Script::Respond {
            code: 226,
            body: Vec::new(),
        })),
        Arc::new(LocalFileIoProvider),
    );

    let id = manager
        .upload_file("ftp://server/up.txt", &path, None, Some("user"), Some("pw"))
        .unwrap();
    manager.start_transfer(id).unwrap();

    let last = loop {
        let update = rx.recv().await.unwrap();
        if update.status.is_terminal() {
            break update;
        }
    };
    assert_eq!(last.xfer_id, id);
    assert_eq!(last.status, FileIoStatus::Success);
    manager.shutdown().await;
}
