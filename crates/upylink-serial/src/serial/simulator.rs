//! In-memory MicroPython-like board.
//!
//! `SimulatedBoard` implements `SerialTransport` and answers the way a
//! MicroPython REPL does: a small friendly-mode line editor, raw mode with
//! `OK<stdout>\x04<stderr>\x04>` responses, and a flat file system driven
//! by the snippets `DeviceFileOps` generates. Tests use it to exercise the
//! whole stack without hardware; the CLI can use it for offline demos.

use crate::serial::error::ReplResult;
use crate::serial::literal::{decode_bytes_literal, decode_str_literal, encode_str_literal};
use crate::serial::transport::{SerialTransport, SimulatedTransport};
use crate::serial::types::*;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

const BANNER: &[u8] =
    b"\r\nMicroPython v1.19.1 on 2022-06-18; Simulated board\r\nType \"help()\" for more information.\r\n>>> ";
const FRIENDLY_PROMPT: &[u8] = b"\r\n>>> ";
const ENOENT: &str = "OSError: [Errno 2] ENOENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Friendly,
    Raw,
}

#[derive(Default)]
struct BoardState {
    files: BTreeMap<String, Vec<u8>>,
    /// File opened for writing: name and bytes written so far.
    writing: Option<(String, Vec<u8>)>,
    /// Contents of the file opened for reading.
    reading: Option<Vec<u8>>,
    line: Vec<u8>,
    raw_buf: Vec<u8>,
    /// Bytes of an escape sequence being skipped in friendly mode.
    escape: usize,
    executed: usize,
    soft_reboots: usize,
    max_write: usize,
    failures: Vec<(String, String)>,
    mute: bool,
}

/// A simulated MicroPython device.
pub struct SimulatedBoard {
    link: Arc<SimulatedTransport>,
    mode: Mutex<Mode>,
    state: Mutex<BoardState>,
}

impl SimulatedBoard {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            link: SimulatedTransport::new(port_name),
            mode: Mutex::new(Mode::Friendly),
            state: Mutex::new(BoardState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mode(&self) -> MutexGuard<'_, Mode> {
        self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── File system access ──────────────────────────────────────────

    pub fn add_file(&self, name: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.state().files.insert(name.into(), content.into());
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state().files.get(name).cloned()
    }

    // ── Behaviour knobs ─────────────────────────────────────────────

    /// Make every raw command containing `fragment` fail with `error_line`.
    pub fn fail_commands_containing(&self, fragment: impl Into<String>, error_line: impl Into<String>) {
        self.state().failures.push((fragment.into(), error_line.into()));
    }

    /// A mute board swallows every write and never answers.
    pub fn set_mute(&self, mute: bool) {
        self.state().mute = mute;
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Number of non-empty commands executed in raw mode.
    pub fn executed_commands(&self) -> usize {
        self.state().executed
    }

    pub fn soft_reboots(&self) -> usize {
        self.state().soft_reboots
    }

    pub fn in_raw_mode(&self) -> bool {
        *self.mode() == Mode::Raw
    }

    /// Largest single write the board has received.
    pub fn max_write_len(&self) -> usize {
        self.state().max_write
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Byte handling
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn receive(&self, data: &[u8]) -> Vec<u8> {
        let mut state = self.state();
        state.max_write = state.max_write.max(data.len());
        if state.mute {
            return Vec::new();
        }
        let mut mode = self.mode();
        let mut out = Vec::new();
        for &b in data {
            match *mode {
                Mode::Friendly => friendly_byte(&mut state, &mut mode, b, &mut out),
                Mode::Raw => raw_byte(&mut state, &mut mode, b, &mut out),
            }
        }
        out
    }
}

fn friendly_byte(state: &mut BoardState, mode: &mut Mode, b: u8, out: &mut Vec<u8>) {
    if state.escape > 0 {
        state.escape += 1;
        // ESC [ then parameters until a final byte in 0x40..=0x7e.
        if state.escape > 2 && (0x40..=0x7e).contains(&b) {
            state.escape = 0;
        }
        return;
    }
    match b {
        RAW_ENTER => {
            state.line.clear();
            state.raw_buf.clear();
            *mode = Mode::Raw;
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(RAW_PROMPT);
        }
        RAW_EXIT => {
            state.line.clear();
            out.extend_from_slice(BANNER);
        }
        INTERRUPT => {
            state.line.clear();
            out.extend_from_slice(FRIENDLY_PROMPT);
        }
        EOT => {
            state.soft_reboots += 1;
            out.extend_from_slice(b"\r\nMPY: soft reboot");
            out.extend_from_slice(BANNER);
        }
        0x1b => state.escape = 1,
        0x08 | 0x7f => {
            if state.line.pop().is_some() {
                out.extend_from_slice(b"\x08\x1b[K");
            }
        }
        b'\r' => {
            let line = String::from_utf8_lossy(&state.line).into_owned();
            state.line.clear();
            out.extend_from_slice(b"\r\n");
            if !line.trim().is_empty() {
                let (stdout, stderr) = run_command(state, &line);
                out.extend_from_slice(&stdout);
                out.extend_from_slice(&stderr);
            }
            out.extend_from_slice(b">>> ");
        }
        b'\n' => {}
        _ => {
            state.line.push(b);
            out.push(b);
        }
    }
}

fn raw_byte(state: &mut BoardState, mode: &mut Mode, b: u8, out: &mut Vec<u8>) {
    match b {
        RAW_ENTER => {
            state.raw_buf.clear();
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(RAW_PROMPT);
        }
        RAW_EXIT => {
            state.raw_buf.clear();
            *mode = Mode::Friendly;
            out.extend_from_slice(BANNER);
        }
        INTERRUPT => state.raw_buf.clear(),
        EOT if state.raw_buf.is_empty() => {
            state.soft_reboots += 1;
            state.writing = None;
            state.reading = None;
            out.extend_from_slice(b"OK\r\nMPY: soft reboot\r\n");
            out.extend_from_slice(RAW_PROMPT);
        }
        EOT => {
            let command = String::from_utf8_lossy(&state.raw_buf).into_owned();
            state.raw_buf.clear();
            let (stdout, stderr) = run_command(state, &command);
            out.extend_from_slice(b"OK");
            out.extend_from_slice(&stdout);
            out.push(EOT);
            out.extend_from_slice(&stderr);
            out.push(EOT);
            out.push(b'>');
        }
        _ => state.raw_buf.push(b),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Command interpreter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn traceback(last_line: &str) -> Vec<u8> {
    format!(
        "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n{}\r\n",
        last_line
    )
    .into_bytes()
}

fn capture<'t>(pattern: &str, text: &'t str) -> Option<&'t str> {
    let re = Regex::new(pattern).ok()?;
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Run one command and return `(stdout, stderr)`.
fn run_command(state: &mut BoardState, command: &str) -> (Vec<u8>, Vec<u8>) {
    let cmd = command.trim();
    if cmd.is_empty() {
        return (Vec::new(), Vec::new());
    }
    state.executed += 1;

    if let Some((_, line)) = state.failures.iter().find(|(frag, _)| cmd.contains(frag.as_str())) {
        return (Vec::new(), traceback(line));
    }

    let ok = |stdout: Vec<u8>| (stdout, Vec::new());
    let fail = |line: &str| (Vec::new(), traceback(line));

    match cmd {
        "import os" | "r = f.read" | "result = True" | "f = fd.write" => return ok(Vec::new()),
        "print(os.listdir())" => {
            let names: Vec<String> = state.files.keys().map(|n| encode_str_literal(n)).collect();
            return ok(format!("[{}]\r\n", names.join(", ")).into_bytes());
        }
        "print(os.uname())" => {
            return ok(b"(sysname='simboard', nodename='simboard', release='1.19.1', \
                        version='v1.19.1 on 2022-06-18', machine='Simulated board with RP2040')\r\n"
                .to_vec());
        }
        "fd.close()" => {
            return match state.writing.take() {
                Some((name, content)) => {
                    state.files.insert(name, content);
                    ok(Vec::new())
                }
                None => fail("NameError: name 'fd' isn't defined"),
            };
        }
        "f.close()" => {
            state.reading = None;
            return ok(Vec::new());
        }
        _ => {}
    }

    // UART discovery for reads.
    if cmd.starts_with("try:") && cmd.contains("uart") {
        return ok(Vec::new());
    }
    if cmd.starts_with("while result:") {
        return match state.reading.take() {
            Some(content) => ok(content),
            None => fail("NameError: name 'r' isn't defined"),
        };
    }
    if let Some(name) = capture(r"^fd = open\((.+), 'wb'\)$", cmd) {
        return match decode_str_literal(name) {
            Ok(name) => {
                state.writing = Some((name, Vec::new()));
                ok(Vec::new())
            }
            Err(_) => fail("SyntaxError: invalid syntax"),
        };
    }
    if let Some(name) = capture(r"^f = open\((.+), 'rb'\)$", cmd) {
        return match decode_str_literal(name).map(|n| state.files.get(&n).cloned()) {
            Ok(Some(content)) => {
                state.reading = Some(content);
                ok(Vec::new())
            }
            Ok(None) => fail(ENOENT),
            Err(_) => fail("SyntaxError: invalid syntax"),
        };
    }
    if let Some(literal) = capture(r"^f\((b.*)\)$", cmd) {
        return match (decode_bytes_literal(literal), state.writing.as_mut()) {
            (Ok(bytes), Some((_, content))) => {
                content.extend_from_slice(&bytes);
                ok(Vec::new())
            }
            (Err(_), _) => fail("SyntaxError: invalid syntax"),
            (_, None) => fail("NameError: name 'f' isn't defined"),
        };
    }
    if let Some(name) = capture(r"^os\.remove\((.+)\)$", cmd) {
        return match decode_str_literal(name).map(|n| state.files.remove(&n)) {
            Ok(Some(_)) => ok(Vec::new()),
            Ok(None) => fail(ENOENT),
            Err(_) => fail("SyntaxError: invalid syntax"),
        };
    }
    if let Some(text) = capture(r"^print\((.+)\)$", cmd) {
        if let Ok(text) = decode_str_literal(text) {
            return ok(format!("{}\r\n", text).into_bytes());
        }
    }
    fail("SyntaxError: invalid syntax")
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedBoard {
    async fn open(&self, config: &SerialConfig) -> ReplResult<()> {
        self.link.open(config).await
    }

    async fn close(&self) -> ReplResult<()> {
        self.link.close().await
    }

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize> {
        self.link.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> ReplResult<usize> {
        if !self.link.is_open() {
            return self.link.write(buf).await;
        }
        let reply = self.receive(buf);
        if !reply.is_empty() {
            self.link.inject_rx(&reply).await;
        }
        Ok(buf.len())
    }

    async fn set_baud_rate(&self, baud: u32) -> ReplResult<()> {
        self.link.set_baud_rate(baud).await
    }

    async fn clear_input(&self) -> ReplResult<()> {
        self.link.clear_input().await
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn port_name(&self) -> &str {
        self.link.port_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_board() -> Arc<SimulatedBoard> {
        let board = SimulatedBoard::new("sim");
        board.open(&SerialConfig::for_port("sim")).await.unwrap();
        board
    }

    async fn read_all(board: &SimulatedBoard) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = board.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_friendly_echo_and_print() {
        let board = open_board().await;
        board.write(b"print('hi')\r").await.unwrap();
        let out = read_all(&board).await;
        assert_eq!(out, b"print('hi')\r\nhi\r\n>>> ");
    }

    #[tokio::test]
    async fn test_raw_mode_exchange() {
        let board = open_board().await;
        board.write(&[RAW_ENTER]).await.unwrap();
        assert!(board.in_raw_mode());
        board.write(b"print('x')\x04").await.unwrap();
        let out = read_all(&board).await;
        assert!(out.ends_with(b"OKx\r\n\x04\x04>"));
        board.write(&[RAW_EXIT]).await.unwrap();
        assert!(!board.in_raw_mode());
    }

    #[tokio::test]
    async fn test_raw_soft_reboot() {
        let board = open_board().await;
        board.write(&[RAW_ENTER, EOT]).await.unwrap();
        let out = read_all(&board).await;
        assert!(out.ends_with(b"soft reboot\r\nraw REPL; CTRL-B to exit\r\n>"));
        assert_eq!(board.soft_reboots(), 1);
    }

    #[test]
    fn test_remove_missing_file() {
        let mut state = BoardState::default();
        let (out, err) = run_command(&mut state, "os.remove('nope.py')");
        assert!(out.is_empty());
        assert!(String::from_utf8(err).unwrap().ends_with("ENOENT\r\n"));
    }

    #[test]
    fn test_listdir_repr() {
        let mut state = BoardState::default();
        state.files.insert("b.py".into(), Vec::new());
        state.files.insert("a.py".into(), Vec::new());
        let (out, _) = run_command(&mut state, "print(os.listdir())");
        assert_eq!(out, b"['a.py', 'b.py']\r\n");
    }

    #[tokio::test]
    async fn test_mute_board_is_silent() {
        let board = open_board().await;
        board.set_mute(true);
        board.write(&[INTERRUPT]).await.unwrap();
        assert!(read_all(&board).await.is_empty());
    }
}
