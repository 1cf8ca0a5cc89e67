//! `upyfs`: file transfer to and from MicroPython boards.
//!
//! The device protocol lives in `upylink-serial`; this crate adds the
//! settings file, log setup and the command line.

pub mod cli;
pub mod config;
pub mod logging;
