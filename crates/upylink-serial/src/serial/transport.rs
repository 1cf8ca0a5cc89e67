//! Serial port transport abstraction.
//!
//! `SerialTransport` is the seam every protocol layer talks through. The
//! OS-backed implementation drives the `serialport` crate from blocking
//! tasks; the simulated one keeps both directions in memory so the raw REPL,
//! file operations and terminal can be tested without hardware.

use crate::serial::error::{ReplError, ReplResult};
use crate::serial::types::*;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic serial port transport.
///
/// Implementations must be `Send + Sync` so they can be moved into the
/// worker task that owns the port.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync {
    /// Open the port with the given configuration.
    async fn open(&self, config: &SerialConfig) -> ReplResult<()>;

    /// Close the port.
    async fn close(&self) -> ReplResult<()>;

    /// Read up to `buf.len()` bytes into `buf`. Returns `Ok(0)` when nothing
    /// arrived within the physical read timeout.
    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize>;

    /// Write all bytes in `buf`.
    async fn write(&self, buf: &[u8]) -> ReplResult<usize>;

    /// Change the baud rate of an open port.
    async fn set_baud_rate(&self, baud: u32) -> ReplResult<()>;

    /// Discard anything waiting in the receive buffer.
    async fn clear_input(&self) -> ReplResult<()>;

    /// Check whether the port is open.
    fn is_open(&self) -> bool;

    /// Retrieve the port name.
    fn port_name(&self) -> &str;
}

#[async_trait::async_trait]
impl<T: SerialTransport + ?Sized> SerialTransport for Arc<T> {
    async fn open(&self, config: &SerialConfig) -> ReplResult<()> {
        (**self).open(config).await
    }

    async fn close(&self) -> ReplResult<()> {
        (**self).close().await
    }

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize> {
        (**self).read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> ReplResult<usize> {
        (**self).write(buf).await
    }

    async fn set_baud_rate(&self, baud: u32) -> ReplResult<()> {
        (**self).set_baud_rate(baud).await
    }

    async fn clear_input(&self) -> ReplResult<()> {
        (**self).clear_input().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn port_name(&self) -> &str {
        (**self).port_name()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Exclusive owner of an open transport.
///
/// Not `Clone`: whoever holds the handle is the only party talking to the
/// device. Workers hand it back on shutdown so it can move between the file
/// manager and the interactive REPL.
pub struct PortHandle {
    transport: Box<dyn SerialTransport>,
}

impl PortHandle {
    /// Wrap a transport that is already open.
    pub fn new(transport: impl SerialTransport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
        }
    }

    /// Open `transport` with `config` and take ownership of it.
    pub async fn open(
        transport: impl SerialTransport + 'static,
        config: &SerialConfig,
    ) -> ReplResult<Self> {
        transport.open(config).await?;
        log::info!(
            "Opened {} at {}",
            transport.port_name(),
            config.shorthand()
        );
        Ok(Self::new(transport))
    }

    /// Write every byte of `data`, logging the traffic at trace level.
    pub async fn write_all(&self, data: &[u8]) -> ReplResult<()> {
        log::trace!("{} TX {}", self.port_name(), bytes_to_hex(data));
        let mut written = 0;
        while written < data.len() {
            let n = self.transport.write(&data[written..]).await?;
            if n == 0 {
                return Err(ReplError::port_unavailable("Port accepted no bytes")
                    .with_port(self.port_name()));
            }
            written += n;
        }
        Ok(())
    }

    /// Close the port and drop the handle.
    pub async fn close(self) -> ReplResult<()> {
        log::info!("Closing {}", self.port_name());
        self.transport.close().await
    }
}

impl Deref for PortHandle {
    type Target = dyn SerialTransport;

    fn deref(&self) -> &Self::Target {
        self.transport.as_ref()
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("port_name", &self.port_name())
            .field("open", &self.is_open())
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  OS serial port
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport over a real serial device via the `serialport` crate.
///
/// The blocking port lives behind a std mutex and every call runs on the
/// blocking pool, so the async caller never stalls the runtime.
pub struct SystemTransport {
    name: String,
    port: Arc<std::sync::Mutex<Option<Box<dyn serialport::SerialPort>>>>,
    open: Arc<AtomicBool>,
}

impl SystemTransport {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            name: port_name.into(),
            port: Arc::new(std::sync::Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn with_port<R, F>(&self, f: F) -> ReplResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn serialport::SerialPort) -> ReplResult<R> + Send + 'static,
    {
        let slot = Arc::clone(&self.port);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| ReplError::port_unavailable("Serial port lock poisoned"))?;
            match guard.as_mut() {
                Some(port) => f(port.as_mut()),
                None => Err(ReplError::port_unavailable("Port not open")),
            }
        })
        .await
        .map_err(|e| ReplError::port_unavailable(format!("Task join error: {}", e)))?;
        result.map_err(|e| e.with_port(self.name.clone()))
    }
}

#[async_trait::async_trait]
impl SerialTransport for SystemTransport {
    async fn open(&self, config: &SerialConfig) -> ReplResult<()> {
        if self.open.load(Ordering::SeqCst) {
            return Err(
                ReplError::port_unavailable(format!("Port {} already open", self.name))
                    .with_port(self.name.clone()),
            );
        }
        let builder = serialport::new(&self.name, config.baud_rate.value())
            .data_bits(config.data_bits.to_serialport())
            .parity(config.parity.to_serialport())
            .stop_bits(config.stop_bits.to_serialport())
            .timeout(Duration::from_millis(config.read_timeout_ms));
        let name = self.name.clone();
        let opened = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(|e| ReplError::port_unavailable(format!("Task join error: {}", e)))?
            .map_err(|e| {
                ReplError::from(e)
                    .with_port(name.clone())
            })?;

        let mut slot = self
            .port
            .lock()
            .map_err(|_| ReplError::port_unavailable("Serial port lock poisoned"))?;
        *slot = Some(opened);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        let mut slot = self
            .port
            .lock()
            .map_err(|_| ReplError::port_unavailable("Serial port lock poisoned"))?;
        *slot = None;
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize> {
        let len = buf.len();
        let data = self
            .with_port(move |port| {
                let mut local = vec![0u8; len];
                match port.read(&mut local) {
                    Ok(n) => {
                        local.truncate(n);
                        Ok(local)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write(&self, buf: &[u8]) -> ReplResult<usize> {
        let data = buf.to_vec();
        self.with_port(move |port| {
            port.write_all(&data)?;
            port.flush()?;
            Ok(data.len())
        })
        .await
    }

    async fn set_baud_rate(&self, baud: u32) -> ReplResult<()> {
        self.with_port(move |port| port.set_baud_rate(baud).map_err(ReplError::from))
            .await
    }

    async fn clear_input(&self) -> ReplResult<()> {
        self.with_port(|port| {
            port.clear(serialport::ClearBuffer::Input)
                .map_err(ReplError::from)
        })
        .await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory port. Tests script the board side through `inject_rx`
/// and inspect what the host sent with `drain_tx`.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    baud: AtomicU32,
    read_timeout_ms: AtomicU32,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<VecDeque<u8>>,
    rx_notify: Notify,
    loopback: AtomicBool,
}

impl SimulatedTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            baud: AtomicU32::new(BaudRate::default().value()),
            read_timeout_ms: AtomicU32::new(20),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            rx_notify: Notify::new(),
            loopback: AtomicBool::new(false),
        })
    }

    /// Echo every write back as received data.
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Queue `data` as if the board had sent it.
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_one();
    }

    /// Everything written since the last call.
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        buf.drain(..).collect()
    }

    /// Baud rate most recently applied by `open` or `set_baud_rate`.
    pub fn current_baud(&self) -> u32 {
        self.baud.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self, config: &SerialConfig) -> ReplResult<()> {
        if self.open.load(Ordering::SeqCst) {
            return Err(ReplError::port_unavailable(format!(
                "Port {} already open",
                self.name
            )));
        }
        self.baud.store(config.baud_rate.value(), Ordering::SeqCst);
        self.read_timeout_ms.store(
            config.read_timeout_ms.min(u32::MAX as u64) as u32,
            Ordering::SeqCst,
        );
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReplError::port_unavailable("Port not open"));
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            let wait = self.read_timeout_ms.load(Ordering::SeqCst) as u64;
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> ReplResult<usize> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReplError::port_unavailable("Port not open"));
        }
        let mut tx = self.tx_buf.lock().await;
        tx.extend(buf);
        drop(tx);

        if self.loopback.load(Ordering::SeqCst) {
            self.inject_rx(buf).await;
        }
        Ok(buf.len())
    }

    async fn set_baud_rate(&self, baud: u32) -> ReplResult<()> {
        self.baud.store(baud, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_input(&self) -> ReplResult<()> {
        self.rx_buf.lock().await.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Hex rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert bytes to a hex string for trace logs.
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
