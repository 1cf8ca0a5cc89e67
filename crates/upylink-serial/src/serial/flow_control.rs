//! Windowed ENQ/ACK transport for boards with tiny receive buffers.
//!
//! Snek boards drop input when the host writes faster than they can
//! consume it. `FlowControlledTransport` sends at most one window of bytes,
//! follows it with ENQ and holds the rest until the board answers ACK. On
//! open it probes the candidate baud rates with DC4 and keeps the first one
//! the board echoes.

use crate::serial::error::{ReplError, ReplResult};
use crate::serial::transport::SerialTransport;
use crate::serial::types::{BaudRate, FlowControlConfig, SerialConfig, INTERRUPT};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const DC4: u8 = 0x14;

#[derive(Debug, Default)]
struct FlowState {
    /// Bytes waiting for window credit.
    queue: VecDeque<u8>,
    /// Bytes that may still go out before the next ENQ.
    credit: usize,
    awaiting_ack: bool,
    /// Received bytes with ACK and DC4 removed.
    inbound: VecDeque<u8>,
}

/// Transport wrapper adding autobaud detection and windowed writes.
pub struct FlowControlledTransport<T: SerialTransport> {
    inner: T,
    config: FlowControlConfig,
    state: Mutex<FlowState>,
    detected_baud: AtomicU32,
}

impl<T: SerialTransport> FlowControlledTransport<T> {
    pub fn new(inner: T, config: FlowControlConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(FlowState::default()),
            detected_baud: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn window(&self) -> usize {
        self.config.window_size.max(1)
    }

    /// Baud rate the board answered the DC4 probe at, if any.
    pub fn detected_baud(&self) -> Option<u32> {
        match self.detected_baud.load(Ordering::SeqCst) {
            0 => None,
            baud => Some(baud),
        }
    }

    /// Bytes still held back waiting for an ACK.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Keep reading until every queued byte has been sent or `timeout`
    /// elapses. Data received meanwhile stays available to `read`.
    pub async fn flush_pending(&self, timeout: Duration) -> ReplResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending_len().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err(ReplError::not_responding(format!(
                    "No ACK within {} ms",
                    timeout.as_millis()
                ))
                .with_port(self.inner.port_name()));
            }
            self.receive().await?;
        }
        Ok(())
    }

    async fn write_fully(&self, data: &[u8]) -> ReplResult<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self.inner.write(&data[written..]).await?;
            if n == 0 {
                return Err(ReplError::port_unavailable("Port accepted no bytes")
                    .with_port(self.inner.port_name()));
            }
            written += n;
        }
        Ok(())
    }

    /// Send queued bytes while window credit lasts.
    async fn pump(&self, state: &mut FlowState) -> ReplResult<()> {
        while !state.awaiting_ack && !state.queue.is_empty() {
            let n = state.credit.min(state.queue.len());
            let chunk: Vec<u8> = state.queue.drain(..n).collect();
            self.write_fully(&chunk).await?;
            state.credit -= n;
            if state.credit == 0 {
                log::trace!("{}: window full, sending ENQ", self.inner.port_name());
                self.write_fully(&[ENQ]).await?;
                state.awaiting_ack = true;
            }
        }
        Ok(())
    }

    /// One physical read: strip flow bytes, buffer the rest, release the
    /// next window on ACK.
    async fn receive(&self) -> ReplResult<()> {
        let mut raw = [0u8; 256];
        let n = self.inner.read(&mut raw).await?;
        if n == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let mut acked = false;
        for &b in &raw[..n] {
            match b {
                ACK => acked = true,
                DC4 => {}
                _ => state.inbound.push_back(b),
            }
        }
        if acked {
            state.awaiting_ack = false;
            state.credit = self.window();
            self.pump(&mut state).await?;
        }
        Ok(())
    }

    /// Try each candidate rate until the board echoes DC4.
    async fn autobaud(&self, candidates: &[u32]) -> ReplResult<Option<u32>> {
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        for (i, &baud) in candidates.iter().enumerate() {
            if i > 0 {
                self.inner.set_baud_rate(baud).await?;
            }
            self.inner.clear_input().await?;
            self.write_fully(&[DC4, b'\n']).await?;

            let deadline = tokio::time::Instant::now() + probe_timeout;
            let mut buf = [0u8; 64];
            while tokio::time::Instant::now() < deadline {
                let n = self.inner.read(&mut buf).await?;
                if buf[..n].contains(&DC4) {
                    return Ok(Some(baud));
                }
            }
            log::debug!("{}: no DC4 echo at {} baud", self.inner.port_name(), baud);
        }
        if candidates.len() > 1 {
            self.inner.set_baud_rate(candidates[0]).await?;
        }
        Ok(None)
    }
}

fn drain_into(inbound: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let count = buf.len().min(inbound.len());
    for (slot, byte) in buf.iter_mut().zip(inbound.drain(..count)) {
        *slot = byte;
    }
    count
}

#[async_trait::async_trait]
impl<T: SerialTransport> SerialTransport for FlowControlledTransport<T> {
    async fn open(&self, config: &SerialConfig) -> ReplResult<()> {
        let candidates = if self.config.candidate_bauds.is_empty() {
            vec![config.baud_rate.value()]
        } else {
            self.config.candidate_bauds.clone()
        };
        let first = SerialConfig {
            baud_rate: BaudRate::from_value(candidates[0]),
            ..config.clone()
        };
        self.inner.open(&first).await?;
        *self.state.lock().await = FlowState {
            credit: self.window(),
            ..Default::default()
        };

        match self.autobaud(&candidates).await? {
            Some(baud) => {
                log::info!("{}: board answered at {} baud", self.inner.port_name(), baud);
                self.detected_baud.store(baud, Ordering::SeqCst);
            }
            None => {
                log::warn!(
                    "{}: no autobaud answer, using {} baud",
                    self.inner.port_name(),
                    candidates[0]
                );
                self.detected_baud.store(0, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        let mut state = self.state.lock().await;
        state.queue.clear();
        state.inbound.clear();
        drop(state);
        self.inner.close().await
    }

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize> {
        {
            let mut state = self.state.lock().await;
            if !state.inbound.is_empty() {
                return Ok(drain_into(&mut state.inbound, buf));
            }
        }
        self.receive().await?;
        let mut state = self.state.lock().await;
        Ok(drain_into(&mut state.inbound, buf))
    }

    async fn write(&self, buf: &[u8]) -> ReplResult<usize> {
        let mut state = self.state.lock().await;
        if buf.contains(&INTERRUPT) {
            if !state.queue.is_empty() {
                log::debug!(
                    "{}: interrupt discards {} queued byte(s)",
                    self.inner.port_name(),
                    state.queue.len()
                );
            }
            state.queue.clear();
            state.awaiting_ack = false;
            state.credit = self.window();
        }
        state.queue.extend(buf);
        self.pump(&mut state).await?;
        Ok(buf.len())
    }

    async fn set_baud_rate(&self, baud: u32) -> ReplResult<()> {
        self.inner.set_baud_rate(baud).await
    }

    async fn clear_input(&self) -> ReplResult<()> {
        self.state.lock().await.inbound.clear();
        self.inner.clear_input().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn port_name(&self) -> &str {
        self.inner.port_name()
    }
}
