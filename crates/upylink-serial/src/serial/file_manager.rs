//! File manager worker.
//!
//! One background task owns the `PortHandle` and runs file requests
//! strictly one at a time, in submission order. Callers never wait on the
//! device: they queue a `FileRequest` and read the outcome as a
//! `FileEvent` from the channel returned by `FileManager::start`.

use crate::serial::error::{ReplError, ReplResult};
use crate::serial::file_ops::DeviceFileOps;
use crate::serial::transport::PortHandle;
use crate::serial::types::RawReplConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Requests & events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequest {
    List,
    /// Copy a device file to a local path.
    Get { remote: String, local: PathBuf },
    /// Upload a local file; `remote` defaults to the local base name.
    Put { local: PathBuf, remote: Option<String> },
    Delete { remote: String },
    Version,
}

/// Outcome of one request.
#[derive(Debug, Clone)]
pub enum FileEvent {
    Listed(Vec<String>),
    ListFailed(ReplError),
    Got { remote: String, local: PathBuf },
    GetFailed { remote: String, error: ReplError },
    Put { remote: String },
    PutFailed { local: PathBuf, error: ReplError },
    Deleted { remote: String },
    DeleteFailed { remote: String, error: ReplError },
    Version(BTreeMap<String, String>),
    VersionFailed(ReplError),
}

impl FileEvent {
    pub fn error(&self) -> Option<&ReplError> {
        match self {
            Self::ListFailed(error)
            | Self::GetFailed { error, .. }
            | Self::PutFailed { error, .. }
            | Self::DeleteFailed { error, .. }
            | Self::VersionFailed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error().is_some()
    }
}

enum WorkerMessage {
    Request(FileRequest),
    Shutdown(oneshot::Sender<PortHandle>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Manager handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to the file worker.
pub struct FileManager {
    port_name: String,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl FileManager {
    /// Spawn the worker on `port`. It lists the device files straight away.
    pub fn start(
        port: PortHandle,
        config: RawReplConfig,
    ) -> (Self, mpsc::UnboundedReceiver<FileEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let port_name = port.port_name().to_string();
        log::info!("File manager started on {}", port_name);

        let worker = Worker {
            port,
            config,
            events: event_tx,
        };
        tokio::spawn(worker.run(rx));

        (Self { port_name, tx }, event_rx)
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Queue a request.
    pub fn submit(&self, request: FileRequest) -> ReplResult<()> {
        self.tx
            .send(WorkerMessage::Request(request))
            .map_err(|_| ReplError::worker_stopped().with_port(self.port_name.clone()))
    }

    pub fn list(&self) -> ReplResult<()> {
        self.submit(FileRequest::List)
    }

    pub fn get(&self, remote: impl Into<String>, local: impl Into<PathBuf>) -> ReplResult<()> {
        self.submit(FileRequest::Get {
            remote: remote.into(),
            local: local.into(),
        })
    }

    pub fn put(&self, local: impl Into<PathBuf>, remote: Option<String>) -> ReplResult<()> {
        self.submit(FileRequest::Put {
            local: local.into(),
            remote,
        })
    }

    pub fn delete(&self, remote: impl Into<String>) -> ReplResult<()> {
        self.submit(FileRequest::Delete {
            remote: remote.into(),
        })
    }

    pub fn version(&self) -> ReplResult<()> {
        self.submit(FileRequest::Version)
    }

    /// Stop after the queued requests and take the port back.
    pub async fn shutdown(self) -> ReplResult<PortHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Shutdown(reply_tx))
            .map_err(|_| ReplError::worker_stopped().with_port(self.port_name.clone()))?;
        reply_rx
            .await
            .map_err(|_| ReplError::worker_stopped().with_port(self.port_name.clone()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Worker task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Worker {
    port: PortHandle,
    config: RawReplConfig,
    events: mpsc::UnboundedSender<FileEvent>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        self.handle(FileRequest::List).await;

        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMessage::Request(request) => self.handle(request).await,
                WorkerMessage::Shutdown(reply) => {
                    log::info!("File manager on {} stopped", self.port.port_name());
                    if let Err(port) = reply.send(self.port) {
                        let _ = port.close().await;
                    }
                    return;
                }
            }
        }

        log::debug!("File manager handle dropped, closing {}", self.port.port_name());
        let _ = self.port.close().await;
    }

    fn emit(&self, event: FileEvent) {
        if let Some(error) = event.error() {
            log::warn!("File operation failed: {}", error);
        }
        let _ = self.events.send(event);
    }

    fn ops(&self) -> DeviceFileOps<'_> {
        DeviceFileOps::new(&self.port, self.config.clone())
    }

    /// Run one request; successful changes are followed by a listing.
    async fn handle(&self, request: FileRequest) {
        if self.perform(request).await {
            self.perform(FileRequest::List).await;
        }
    }

    /// Returns whether a fresh listing should follow.
    async fn perform(&self, request: FileRequest) -> bool {
        match request {
            FileRequest::List => {
                self.emit(match self.ops().list().await {
                    Ok(names) => FileEvent::Listed(names),
                    Err(e) => FileEvent::ListFailed(e),
                });
                false
            }
            FileRequest::Get { remote, local } => match self.get(&remote, &local).await {
                Ok(()) => {
                    self.emit(FileEvent::Got { remote, local });
                    true
                }
                Err(error) => {
                    self.emit(FileEvent::GetFailed { remote, error });
                    false
                }
            },
            FileRequest::Put { local, remote } => match self.put(&local, remote).await {
                Ok(remote) => {
                    self.emit(FileEvent::Put { remote });
                    true
                }
                Err(error) => {
                    self.emit(FileEvent::PutFailed { local, error });
                    false
                }
            },
            FileRequest::Delete { remote } => match self.ops().delete(&remote).await {
                Ok(()) => {
                    self.emit(FileEvent::Deleted { remote });
                    true
                }
                Err(error) => {
                    self.emit(FileEvent::DeleteFailed { remote, error });
                    false
                }
            },
            FileRequest::Version => {
                self.emit(match self.ops().version().await {
                    Ok(info) => FileEvent::Version(info),
                    Err(e) => FileEvent::VersionFailed(e),
                });
                false
            }
        }
    }

    async fn get(&self, remote: &str, local: &Path) -> ReplResult<()> {
        let data = self.ops().read(remote).await?;
        tokio::fs::write(local, &data)
            .await
            .map_err(|e| ReplError::local_io(format!("Cannot write {}: {}", local.display(), e)))?;
        log::info!("Copied {} ({} bytes) to {}", remote, data.len(), local.display());
        Ok(())
    }

    async fn put(&self, local: &Path, remote: Option<String>) -> ReplResult<String> {
        let remote = match remote {
            Some(name) => name,
            None => local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    ReplError::local_io(format!("{} has no file name", local.display()))
                })?,
        };
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| ReplError::local_io(format!("Cannot read {}: {}", local.display(), e)))?;
        self.ops().write(&data, &remote).await?;
        log::info!("Uploaded {} ({} bytes) as {}", local.display(), data.len(), remote);
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::error::ReplErrorKind;
    use crate::serial::simulator::SimulatedBoard;
    use crate::serial::types::SerialConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config() -> RawReplConfig {
        RawReplConfig {
            chunk_delay_ms: 0,
            response_timeout_ms: 300,
            ..Default::default()
        }
    }

    async fn started(board: &Arc<SimulatedBoard>) -> (FileManager, mpsc::UnboundedReceiver<FileEvent>) {
        let port = PortHandle::open(Arc::clone(board), &SerialConfig {
            read_timeout_ms: 10,
            ..SerialConfig::for_port("sim")
        })
        .await
        .unwrap();
        FileManager::start(port, fast_config())
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<FileEvent>) -> FileEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event")
            .expect("channel closed")
    }

    fn listed(event: FileEvent) -> Vec<String> {
        match event {
            FileEvent::Listed(names) => names,
            other => panic!("expected listing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_lists_files() {
        let board = SimulatedBoard::new("sim");
        board.add_file("main.py", b"print('hi')".to_vec());
        let (manager, mut events) = started(&board).await;
        assert_eq!(listed(next(&mut events).await), vec!["main.py"]);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_get_delete_with_follow_up_listing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("blink.py");
        std::fs::write(&source, b"import time\nwhile True:\n    time.sleep(1)\n").unwrap();

        let board = SimulatedBoard::new("sim");
        let (manager, mut events) = started(&board).await;
        assert!(listed(next(&mut events).await).is_empty());

        manager.put(&source, None).unwrap();
        match next(&mut events).await {
            FileEvent::Put { remote } => assert_eq!(remote, "blink.py"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(listed(next(&mut events).await), vec!["blink.py"]);

        let copy = dir.path().join("copy.py");
        manager.get("blink.py", &copy).unwrap();
        assert!(matches!(next(&mut events).await, FileEvent::Got { .. }));
        assert_eq!(listed(next(&mut events).await), vec!["blink.py"]);
        assert_eq!(std::fs::read(&copy).unwrap(), std::fs::read(&source).unwrap());

        manager.delete("blink.py").unwrap();
        assert!(matches!(next(&mut events).await, FileEvent::Deleted { .. }));
        assert!(listed(next(&mut events).await).is_empty());
        assert!(board.file("blink.py").is_none());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_with_remote_name() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local_name.py");
        std::fs::write(&source, b"x = 1\n").unwrap();

        let board = SimulatedBoard::new("sim");
        let (manager, mut events) = started(&board).await;
        next(&mut events).await;

        manager.put(&source, Some("main.py".to_string())).unwrap();
        assert!(matches!(next(&mut events).await, FileEvent::Put { remote } if remote == "main.py"));
        next(&mut events).await;
        assert_eq!(board.file("main.py").unwrap(), b"x = 1\n");
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_skip_follow_up_listing() {
        let dir = tempfile::tempdir().unwrap();
        let board = SimulatedBoard::new("sim");
        let (manager, mut events) = started(&board).await;
        next(&mut events).await;

        manager.get("ghost.py", dir.path().join("ghost.py")).unwrap();
        manager.put(dir.path().join("missing.py"), None).unwrap();
        manager.version().unwrap();

        match next(&mut events).await {
            FileEvent::GetFailed { remote, error } => {
                assert_eq!(remote, "ghost.py");
                assert_eq!(error.kind, ReplErrorKind::RemoteOperationFailed);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut events).await {
            FileEvent::PutFailed { error, .. } => assert_eq!(error.kind, ReplErrorKind::LocalIo),
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut events).await {
            FileEvent::Version(info) => assert_eq!(info["sysname"], "simboard"),
            other => panic!("unexpected {other:?}"),
        }
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_into_missing_directory_is_local_error() {
        let dir = tempfile::tempdir().unwrap();
        let board = SimulatedBoard::new("sim");
        board.add_file("a.py", b"1".to_vec());
        let (manager, mut events) = started(&board).await;
        next(&mut events).await;

        manager.get("a.py", dir.path().join("no/such/dir/a.py")).unwrap();
        let event = next(&mut events).await;
        assert!(event.is_failure());
        assert_eq!(event.error().unwrap().kind, ReplErrorKind::LocalIo);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_device_reports_failure() {
        let board = SimulatedBoard::new("sim");
        board.set_mute(true);
        let (manager, mut events) = started(&board).await;
        match next(&mut events).await {
            FileEvent::ListFailed(e) => assert_eq!(e.kind, ReplErrorKind::DeviceNotResponding),
            other => panic!("unexpected {other:?}"),
        }
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_returns_port_after_queue() {
        let board = SimulatedBoard::new("sim");
        let (manager, mut events) = started(&board).await;
        manager.list().unwrap();
        manager.version().unwrap();

        let port = manager.shutdown().await.unwrap();
        assert!(port.is_open());
        assert!(!board.in_raw_mode());

        assert!(matches!(next(&mut events).await, FileEvent::Listed(_)));
        assert!(matches!(next(&mut events).await, FileEvent::Listed(_)));
        assert!(matches!(next(&mut events).await, FileEvent::Version(_)));
        assert!(events.recv().await.is_none());
    }
}
