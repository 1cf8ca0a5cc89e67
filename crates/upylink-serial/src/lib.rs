//! # upylink – MicroPython serial link
//!
//! Talks to microcontrollers running MicroPython-like runtimes over a serial
//! port:
//!
//! - **Port Discovery** – enumerate serial ports, match boards by USB VID/PID
//! - **Transport** – async read/write over a real or simulated serial port,
//!   with a single-owner `PortHandle`
//! - **Raw REPL** – interrupt the device, enter raw mode, run command batches
//!   and split stdout / stderr
//! - **File Operations** – list, get, put, delete and version via generated
//!   Python snippets, chunked in both directions
//! - **File Manager** – a worker task that serializes file operations and
//!   reports one event per request
//! - **Terminal** – REPL byte-stream emulator (VT100 subset, split UTF-8) and
//!   key translation with device-cursor synchronisation
//! - **Flow Control** – autobaud and ENQ/ACK windowed writes for Snek boards

pub mod serial;
