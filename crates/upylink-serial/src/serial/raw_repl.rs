//! Raw REPL protocol.
//!
//! A `RawReplSession` borrows an open port for one command batch: it
//! interrupts whatever the device is running, switches to raw mode, feeds
//! each command followed by Ctrl-D, collects the `OK<stdout>\x04<stderr>\x04>`
//! responses and finally drops back to the friendly REPL.

use crate::serial::error::{ReplError, ReplErrorKind, ReplResult};
use crate::serial::transport::{bytes_to_hex, PortHandle};
use crate::serial::types::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

const READ_CHUNK: usize = 256;

/// Where the session is in the raw-mode exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawReplState {
    Normal,
    EnteringRaw,
    Raw,
    ExecutingCommand,
    ExitingRaw,
}

/// One raw-mode exchange over a borrowed port.
pub struct RawReplSession<'a> {
    port: &'a PortHandle,
    config: RawReplConfig,
    state: RawReplState,
    /// Bytes read past the last marker, kept for the next `read_until`.
    pending: Vec<u8>,
}

impl<'a> RawReplSession<'a> {
    pub fn new(port: &'a PortHandle, config: RawReplConfig) -> Self {
        Self {
            port,
            config,
            state: RawReplState::Normal,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> RawReplState {
        self.state
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Transitions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Interrupt the device and switch it to raw mode.
    pub async fn enter(&mut self) -> ReplResult<()> {
        self.state = RawReplState::EnteringRaw;
        log::debug!("{}: entering raw REPL", self.port.port_name());

        if self.config.exit_stale_raw {
            self.port.write_all(&[RAW_EXIT]).await?;
        }
        for _ in 0..self.config.interrupt_count.max(1) {
            self.port.write_all(&[INTERRUPT]).await?;
            tokio::time::sleep(Duration::from_millis(self.config.chunk_delay_ms)).await;
        }
        self.read_until(PROMPT_MARKER).await?;

        self.port.write_all(&[RAW_ENTER]).await?;
        self.port.write_all(b"\n").await?;
        self.port.write_all(&[EOT]).await?;
        self.read_until(RAW_ACK_MARKER)
            .await
            .map_err(|e| self.entry_failed(e, "raw REPL did not acknowledge"))?;
        self.read_until(RESPONSE_TERMINATOR)
            .await
            .map_err(|e| self.entry_failed(e, "raw REPL probe was not terminated"))?;

        if self.config.soft_reboot {
            self.soft_reboot().await?;
        }

        // Late prompts must not be read as the first command's response.
        if !self.pending.is_empty() {
            log::trace!(
                "{}: dropping {} byte(s) after raw prompt",
                self.port.port_name(),
                self.pending.len()
            );
            self.pending.clear();
        }
        self.port.clear_input().await?;

        self.state = RawReplState::Raw;
        Ok(())
    }

    /// Soft-reboot from the raw prompt and wait until raw mode is back.
    async fn soft_reboot(&mut self) -> ReplResult<()> {
        log::debug!("{}: soft reboot", self.port.port_name());
        self.port.write_all(&[EOT]).await?;
        self.read_until(SOFT_REBOOT_MARKER)
            .await
            .map_err(|e| self.entry_failed(e, "device did not soft reboot"))?;

        // Some ports print a different banner after the reboot; ask for raw
        // mode again if the prompt never shows up.
        if self.read_until(RAW_PROMPT).await.is_err() {
            self.port.write_all(&[RAW_ENTER]).await?;
            self.read_until(RAW_PROMPT)
                .await
                .map_err(|e| self.entry_failed(e, "raw REPL prompt missing after reboot"))?;
        }
        Ok(())
    }

    /// Send one command and return its `(stdout, stderr)`.
    pub async fn exec_raw(&mut self, command: &str) -> ReplResult<(Vec<u8>, Vec<u8>)> {
        if self.state != RawReplState::Raw {
            return Err(ReplError::raw_mode_entry(format!(
                "Cannot execute in state {:?}",
                self.state
            ))
            .with_port(self.port.port_name()));
        }
        self.state = RawReplState::ExecutingCommand;

        let bytes = command.as_bytes();
        for slice in bytes.chunks(self.config.command_chunk_size.max(1)) {
            self.port.write_all(slice).await?;
            tokio::time::sleep(Duration::from_millis(self.config.chunk_delay_ms)).await;
        }
        self.port.write_all(&[EOT]).await?;
        let response = self.read_until(RESPONSE_TERMINATOR).await?;
        let parts = split_response(&response).map_err(|e| e.with_port(self.port.port_name()));

        self.state = RawReplState::Raw;
        parts
    }

    /// Leave raw mode.
    pub async fn exit(&mut self) -> ReplResult<()> {
        self.state = RawReplState::ExitingRaw;
        let result = self.port.write_all(&[RAW_EXIT]).await;
        self.state = RawReplState::Normal;
        log::debug!("{}: left raw REPL", self.port.port_name());
        result
    }

    /// Run `commands` in order inside one raw-mode session.
    ///
    /// Returns the concatenated stdout. The first command that writes to
    /// stderr stops the batch with `RemoteOperationFailed`; raw mode is left
    /// either way.
    pub async fn run<S: AsRef<str>>(&mut self, commands: &[S]) -> ReplResult<Vec<u8>> {
        self.enter().await?;
        let outcome = self.run_entered(commands).await;
        let exited = self.exit().await;
        match outcome {
            Ok(out) => exited.map(|_| out),
            Err(e) => {
                if let Err(exit_err) = exited {
                    log::warn!("Failed to leave raw REPL after error: {}", exit_err);
                }
                Err(e)
            }
        }
    }

    async fn run_entered<S: AsRef<str>>(&mut self, commands: &[S]) -> ReplResult<Vec<u8>> {
        let mut stdout = Vec::new();
        for command in commands {
            let (out, err) = self.exec_raw(command.as_ref()).await?;
            if !err.is_empty() {
                let message = clean_error(&err);
                log::debug!("{}: remote error: {}", self.port.port_name(), message);
                return Err(ReplError::remote(message).with_port(self.port.port_name()));
            }
            stdout.extend_from_slice(&out);
        }
        Ok(stdout)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Reading
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Read until `marker` has been seen and return everything up to and
    /// including it. Bytes after the marker stay pending.
    async fn read_until(&mut self, marker: &[u8]) -> ReplResult<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.response_timeout_ms);
        let mut scanned = 0;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(pos) = find(&self.pending[scanned..], marker) {
                let end = scanned + pos + marker.len();
                let rest = self.pending.split_off(end);
                let found = std::mem::replace(&mut self.pending, rest);
                return Ok(found);
            }
            scanned = self.pending.len().saturating_sub(marker.len() - 1);

            if Instant::now() >= deadline {
                return Err(ReplError::not_responding(format!(
                    "Timed out waiting for {:?}",
                    String::from_utf8_lossy(marker)
                ))
                .with_port(self.port.port_name()));
            }
            let n = self.port.read(&mut buf).await?;
            if n > 0 {
                log::trace!("{} RX {}", self.port.port_name(), bytes_to_hex(&buf[..n]));
                self.pending.extend_from_slice(&buf[..n]);
            }
        }
    }

    fn entry_failed(&self, err: ReplError, what: &str) -> ReplError {
        match err.kind {
            ReplErrorKind::DeviceNotResponding => {
                ReplError::raw_mode_entry(format!("Could not enter raw REPL: {}", what))
                    .with_port(self.port.port_name())
            }
            _ => err,
        }
    }
}

/// Enter raw mode on `port`, run `commands`, leave raw mode.
pub async fn execute<S: AsRef<str>>(
    port: &PortHandle,
    config: &RawReplConfig,
    commands: &[S],
) -> ReplResult<Vec<u8>> {
    RawReplSession::new(port, config.clone()).run(commands).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Response helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split a raw response `OK<stdout>\x04<stderr>\x04>` into its two streams.
pub fn split_response(response: &[u8]) -> ReplResult<(Vec<u8>, Vec<u8>)> {
    if response.len() < 4 || !response.starts_with(b"OK") {
        return Err(ReplError::decode(format!(
            "Unexpected raw REPL response: {:?}",
            String::from_utf8_lossy(response)
        )));
    }
    let body = &response[2..response.len() - 2];
    let sep = body
        .iter()
        .position(|&b| b == EOT)
        .ok_or_else(|| ReplError::decode("Raw REPL response has no stderr separator"))?;
    Ok((body[..sep].to_vec(), body[sep + 1..].to_vec()))
}

/// Reduce a device traceback to its last meaningful line.
pub fn clean_error(stderr: &[u8]) -> String {
    if stderr.is_empty() {
        return "There was an error.".to_string();
    }
    let decoded = String::from_utf8_lossy(stderr).into_owned();
    let lines: Vec<&str> = decoded.split("\r\n").collect();
    if lines.len() >= 2 {
        lines[lines.len() - 2].to_string()
    } else {
        decoded
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
