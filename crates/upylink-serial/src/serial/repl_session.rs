//! Interactive REPL session.
//!
//! A background task owns the `PortHandle`, feeds everything the device
//! sends through the `TerminalEmulator` and writes translated key presses
//! back. The UI talks to it only through the command and event channels on
//! `ReplSessionHandle`.

use crate::serial::error::{ReplError, ReplResult};
use crate::serial::keys::{key_bytes, paste_bytes, KeyInput, KeyOutcome, Platform};
use crate::serial::terminal::TerminalEmulator;
use crate::serial::transport::PortHandle;
use crate::serial::types::INTERRUPT;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session commands (frontend → session)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Commands that can be sent to a running REPL session.
#[derive(Debug)]
pub enum ReplCommand {
    /// Translate and send a key press.
    SendKey(KeyInput),
    /// Send bytes untouched.
    SendRaw(Vec<u8>),
    /// Send clipboard text with line breaks converted.
    Paste(String),
    /// The user moved the local cursor.
    MoveCursor(usize),
    /// Stop the session and hand the port back.
    Disconnect(oneshot::Sender<PortHandle>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session events (session → frontend)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted by a running REPL session.
#[derive(Debug, Clone)]
pub enum ReplEvent {
    /// Bytes received from the device, before rendering.
    Output(Vec<u8>),
    /// Rendered buffer and view cursor after a change.
    Screen { text: String, cursor: usize },
    /// A copy shortcut was pressed.
    CopyRequested,
    /// A paste shortcut was pressed; answer with `ReplCommand::Paste`.
    PasteRequested,
    Error { message: String, recoverable: bool },
    Closed { reason: String },
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct ReplSessionOptions {
    pub platform: Platform,
    /// Send Ctrl-C once at start so a running program yields the prompt.
    pub interrupt_on_start: bool,
    /// Pause between port reads.
    pub poll_interval_ms: u64,
}

impl Default for ReplSessionOptions {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            interrupt_on_start: true,
            poll_interval_ms: 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to a running REPL session.
pub struct ReplSessionHandle {
    /// Unique session ID.
    pub id: String,
    pub port_name: String,
    /// When the session was started.
    pub connected_at: chrono::DateTime<Utc>,
    cmd_tx: mpsc::Sender<ReplCommand>,
    /// Channel to receive events from the session task.
    pub event_rx: Mutex<mpsc::Receiver<ReplEvent>>,
    connected: Arc<AtomicBool>,
    bytes_rx: Arc<AtomicU64>,
    bytes_tx: Arc<AtomicU64>,
}

impl ReplSessionHandle {
    /// Send a command to the session.
    pub async fn send_command(&self, cmd: ReplCommand) -> ReplResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ReplError::worker_stopped().with_port(self.port_name.clone()))
    }

    pub async fn send_key(&self, key: KeyInput) -> ReplResult<()> {
        self.send_command(ReplCommand::SendKey(key)).await
    }

    pub async fn paste(&self, text: impl Into<String>) -> ReplResult<()> {
        self.send_command(ReplCommand::Paste(text.into())).await
    }

    /// Next event, or `None` once the session task has gone.
    pub async fn next_event(&self) -> Option<ReplEvent> {
        self.event_rx.lock().await.recv().await
    }

    /// Stop the session and take the port back.
    pub async fn disconnect(&self) -> ReplResult<PortHandle> {
        let (tx, rx) = oneshot::channel();
        self.send_command(ReplCommand::Disconnect(tx)).await?;
        rx.await
            .map_err(|_| ReplError::worker_stopped().with_port(self.port_name.clone()))
    }

    /// Check whether the session is still connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Bytes received and sent so far.
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.bytes_rx.load(Ordering::Relaxed),
            self.bytes_tx.load(Ordering::Relaxed),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session runner (async task)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ReplRunner {
    port: PortHandle,
    options: ReplSessionOptions,
    terminal: TerminalEmulator,
    event_tx: mpsc::Sender<ReplEvent>,
    bytes_rx: Arc<AtomicU64>,
    bytes_tx: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
}

impl ReplRunner {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ReplCommand>) {
        let mut read_buf = vec![0u8; 1024];
        let poll = tokio::time::Duration::from_millis(self.options.poll_interval_ms);
        let mut reply_to = None;
        let mut reason = "Session ended".to_string();

        if self.options.interrupt_on_start {
            if let Err(e) = self.send(&[INTERRUPT]).await {
                self.emit_error(&e, true).await;
            }
        }

        loop {
            tokio::select! {
                // Read data from the port
                _ = tokio::time::sleep(poll) => {
                    match self.port.read(&mut read_buf).await {
                        Ok(0) => {}
                        Ok(n) => self.on_received(&read_buf[..n]).await,
                        Err(e) => {
                            self.emit_error(&e, false).await;
                            reason = format!("Port error: {}", e.message);
                            break;
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ReplCommand::Disconnect(reply)) => {
                            reply_to = Some(reply);
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            reason = "Session handle dropped".to_string();
                            break;
                        }
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        log::info!("REPL on {} closed: {}", self.port.port_name(), reason);
        let _ = self.event_tx.send(ReplEvent::Closed { reason }).await;

        match reply_to {
            Some(reply) => {
                if let Err(port) = reply.send(self.port) {
                    let _ = port.close().await;
                }
            }
            None => {
                let _ = self.port.close().await;
            }
        }
    }

    async fn handle_command(&mut self, cmd: ReplCommand) {
        let result = match cmd {
            ReplCommand::SendKey(input) => {
                match key_bytes(&self.terminal, &input, self.options.platform) {
                    KeyOutcome::Send(bytes) => self.send(&bytes).await,
                    KeyOutcome::Copy => {
                        let _ = self.event_tx.send(ReplEvent::CopyRequested).await;
                        Ok(())
                    }
                    KeyOutcome::Paste => {
                        let _ = self.event_tx.send(ReplEvent::PasteRequested).await;
                        Ok(())
                    }
                    KeyOutcome::Ignored => Ok(()),
                }
            }
            ReplCommand::SendRaw(data) => self.send(&data).await,
            ReplCommand::Paste(text) => self.send(&paste_bytes(&text)).await,
            ReplCommand::MoveCursor(pos) => {
                self.terminal.set_view_cursor(pos);
                self.emit_screen().await;
                Ok(())
            }
            // Handled by the loop.
            ReplCommand::Disconnect(_) => Ok(()),
        };
        if let Err(e) = result {
            self.emit_error(&e, true).await;
        }
    }

    async fn on_received(&mut self, data: &[u8]) {
        self.bytes_rx.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.terminal.process_bytes(data);
        let _ = self.event_tx.send(ReplEvent::Output(data.to_vec())).await;
        self.emit_screen().await;
    }

    async fn send(&mut self, data: &[u8]) -> ReplResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.port.write_all(data).await?;
        self.bytes_tx.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn emit_screen(&self) {
        let _ = self
            .event_tx
            .send(ReplEvent::Screen {
                text: self.terminal.text(),
                cursor: self.terminal.view_cursor(),
            })
            .await;
    }

    async fn emit_error(&self, e: &ReplError, recoverable: bool) {
        log::warn!("REPL on {}: {}", self.port.port_name(), e);
        let _ = self
            .event_tx
            .send(ReplEvent::Error {
                message: e.to_string(),
                recoverable,
            })
            .await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Start an interactive session on an open port.
///
/// The session task runs in the background and owns `port` until
/// `disconnect` hands it back.
pub fn start_repl(port: PortHandle, options: ReplSessionOptions) -> ReplSessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel::<ReplCommand>(64);
    let (event_tx, event_rx) = mpsc::channel::<ReplEvent>(256);

    let connected = Arc::new(AtomicBool::new(true));
    let bytes_rx = Arc::new(AtomicU64::new(0));
    let bytes_tx = Arc::new(AtomicU64::new(0));

    let handle = ReplSessionHandle {
        id: uuid::Uuid::new_v4().to_string(),
        port_name: port.port_name().to_string(),
        connected_at: Utc::now(),
        cmd_tx,
        event_rx: Mutex::new(event_rx),
        connected: connected.clone(),
        bytes_rx: bytes_rx.clone(),
        bytes_tx: bytes_tx.clone(),
    };
    log::info!("REPL session {} on {}", handle.id, handle.port_name);

    let runner = ReplRunner {
        port,
        options,
        terminal: TerminalEmulator::new(),
        event_tx,
        bytes_rx,
        bytes_tx,
        connected,
    };
    tokio::spawn(async move {
        runner.run(cmd_rx).await;
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::keys::Key;
    use crate::serial::simulator::SimulatedBoard;
    use crate::serial::transport::{SerialTransport, SimulatedTransport};
    use crate::serial::types::SerialConfig;
    use std::time::Duration;

    fn options() -> ReplSessionOptions {
        ReplSessionOptions {
            platform: Platform::Other,
            interrupt_on_start: false,
            poll_interval_ms: 1,
        }
    }

    fn fast_port_config(name: &str) -> SerialConfig {
        SerialConfig {
            read_timeout_ms: 10,
            ..SerialConfig::for_port(name)
        }
    }

    /// Wait for a screen event whose text satisfies `pred`.
    async fn wait_for_screen(
        handle: &ReplSessionHandle,
        pred: impl Fn(&str) -> bool,
    ) -> (String, usize) {
        let wait = async {
            loop {
                match handle.next_event().await {
                    Some(ReplEvent::Screen { text, cursor }) if pred(&text) => {
                        return (text, cursor)
                    }
                    Some(_) => continue,
                    None => panic!("session closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("screen never matched")
    }

    #[tokio::test]
    async fn test_interrupt_on_start_and_typing() {
        let board = SimulatedBoard::new("sim");
        let port = PortHandle::open(Arc::clone(&board), &fast_port_config("sim"))
            .await
            .unwrap();
        let handle = start_repl(
            port,
            ReplSessionOptions {
                interrupt_on_start: true,
                ..options()
            },
        );

        wait_for_screen(&handle, |t| t.ends_with(">>> ")).await;
        for c in "print('hi')".chars() {
            handle.send_key(KeyInput::plain(Key::Char(c))).await.unwrap();
        }
        handle.send_key(KeyInput::plain(Key::Enter)).await.unwrap();

        let (text, _) = wait_for_screen(&handle, |t| t.contains("hi\n>>> ")).await;
        assert!(text.contains(">>> print('hi')\nhi\n>>> "));

        let (rx, tx) = handle.traffic();
        assert!(rx > 0);
        assert_eq!(tx, 1 + "print('hi')".len() as u64 + 1);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_paste_converts_newlines() {
        let t = SimulatedTransport::new("raw");
        let port = PortHandle::open(Arc::clone(&t), &fast_port_config("raw"))
            .await
            .unwrap();
        let handle = start_repl(port, options());

        handle.paste("a = 1\nb = 2\r\n").await.unwrap();
        let port = handle.disconnect().await.unwrap();
        assert_eq!(t.drain_tx().await, b"a = 1\rb = 2\r");
        assert!(port.is_open());
    }

    #[tokio::test]
    async fn test_clipboard_keys_are_not_sent() {
        let t = SimulatedTransport::new("raw");
        let port = PortHandle::open(Arc::clone(&t), &fast_port_config("raw"))
            .await
            .unwrap();
        let handle = start_repl(port, options());

        let mut chord = KeyInput::ctrl('c');
        chord.modifiers.shift = true;
        handle.send_key(chord).await.unwrap();
        loop {
            match handle.next_event().await {
                Some(ReplEvent::CopyRequested) => break,
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
        handle.disconnect().await.unwrap();
        assert!(t.drain_tx().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_returns_port_and_closes_session() {
        let t = SimulatedTransport::new("raw");
        let port = PortHandle::open(Arc::clone(&t), &fast_port_config("raw"))
            .await
            .unwrap();
        let handle = start_repl(port, options());
        assert!(handle.is_connected());

        let port = handle.disconnect().await.unwrap();
        assert_eq!(port.port_name(), "raw");
        assert!(!handle.is_connected());

        let mut saw_closed = false;
        while let Some(event) = handle.next_event().await {
            if matches!(event, ReplEvent::Closed { .. }) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
        let err = handle.send_key(KeyInput::plain(Key::Enter)).await.unwrap_err();
        assert_eq!(err.kind, crate::serial::error::ReplErrorKind::WorkerStopped);
    }

    #[tokio::test]
    async fn test_move_cursor_then_type_syncs_device() {
        let t = SimulatedTransport::new("raw");
        let port = PortHandle::open(Arc::clone(&t), &fast_port_config("raw"))
            .await
            .unwrap();
        let handle = start_repl(port, options());

        t.inject_rx(b">>> abc").await;
        wait_for_screen(&handle, |text| text == ">>> abc").await;
        handle.send_command(ReplCommand::MoveCursor(5)).await.unwrap();
        wait_for_screen(&handle, |_| true).await;
        handle.send_key(KeyInput::plain(Key::Char('X'))).await.unwrap();

        handle.disconnect().await.unwrap();
        assert_eq!(t.drain_tx().await, b"\x1b[D\x1b[DX");
    }

    #[tokio::test]
    async fn test_port_error_ends_session() {
        let t = SimulatedTransport::new("flaky");
        let port = PortHandle::open(Arc::clone(&t), &fast_port_config("flaky"))
            .await
            .unwrap();
        let handle = start_repl(port, options());
        t.close().await.unwrap();

        let mut saw_error = false;
        while let Some(event) = handle.next_event().await {
            match event {
                ReplEvent::Error { recoverable, .. } => {
                    assert!(!recoverable);
                    saw_error = true;
                }
                ReplEvent::Closed { reason } => {
                    assert!(reason.starts_with("Port error"));
                }
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(!handle.is_connected());
    }
}
