//! Shared types for the MicroPython serial link.
//!
//! Covers port configuration, discovered port metadata, device families,
//! and the raw REPL / flow-control settings handed to the protocol layers.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ctrl-A: enter raw REPL.
pub const RAW_ENTER: u8 = 0x01;
/// Ctrl-B: leave raw REPL.
pub const RAW_EXIT: u8 = 0x02;
/// Ctrl-C: keyboard interrupt.
pub const INTERRUPT: u8 = 0x03;
/// Ctrl-D: execute (raw mode) / soft reboot (empty raw line).
pub const EOT: u8 = 0x04;

/// Friendly-REPL prompt tail.
pub const PROMPT_MARKER: &[u8] = b"\n>";
/// Raw prompt followed by the acknowledgement of the probe command.
pub const RAW_ACK_MARKER: &[u8] = b"\r\n>OK";
/// Terminator of every raw-mode command response.
pub const RESPONSE_TERMINATOR: &[u8] = b"\x04>";
/// Raw prompt printed after entering raw mode or a soft reboot.
pub const RAW_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
/// Banner printed by the device on a soft reboot.
pub const SOFT_REBOOT_MARKER: &[u8] = b"soft reboot\r\n";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Standard baud rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    #[serde(rename = "9600")]
    Baud9600,
    #[serde(rename = "19200")]
    Baud19200,
    #[serde(rename = "38400")]
    Baud38400,
    #[serde(rename = "57600")]
    Baud57600,
    #[serde(rename = "115200")]
    Baud115200,
    #[serde(rename = "230400")]
    Baud230400,
    #[serde(rename = "460800")]
    Baud460800,
    #[serde(rename = "921600")]
    Baud921600,
    /// Custom / non-standard baud rate.
    Custom(u32),
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::Baud115200
    }
}

impl BaudRate {
    /// Numeric value of the baud rate.
    pub fn value(&self) -> u32 {
        match self {
            Self::Baud9600 => 9600,
            Self::Baud19200 => 19200,
            Self::Baud38400 => 38400,
            Self::Baud57600 => 57600,
            Self::Baud115200 => 115200,
            Self::Baud230400 => 230400,
            Self::Baud460800 => 460800,
            Self::Baud921600 => 921600,
            Self::Custom(v) => *v,
        }
    }

    /// Try to parse a baud rate from a numeric value.
    pub fn from_value(v: u32) -> Self {
        match v {
            9600 => Self::Baud9600,
            19200 => Self::Baud19200,
            38400 => Self::Baud38400,
            57600 => Self::Baud57600,
            115200 => Self::Baud115200,
            230400 => Self::Baud230400,
            460800 => Self::Baud460800,
            921600 => Self::Baud921600,
            other => Self::Custom(other),
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
}

impl Default for DataBits {
    fn default() -> Self {
        Self::Eight
    }
}

impl DataBits {
    pub fn value(&self) -> u8 {
        match self {
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }

    pub(crate) fn to_serialport(self) -> serialport::DataBits {
        match self {
            Self::Seven => serialport::DataBits::Seven,
            Self::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Self::None
    }
}

impl Parity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Odd => "O",
            Self::Even => "E",
        }
    }

    pub(crate) fn to_serialport(self) -> serialport::Parity {
        match self {
            Self::None => serialport::Parity::None,
            Self::Odd => serialport::Parity::Odd,
            Self::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        Self::One
    }
}

impl StopBits {
    pub fn label(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::Two => "2",
        }
    }

    pub(crate) fn to_serialport(self) -> serialport::StopBits {
        match self {
            Self::One => serialport::StopBits::One,
            Self::Two => serialport::StopBits::Two,
        }
    }
}

/// Complete serial port configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    /// Port name (e.g. `COM3`, `/dev/ttyACM0`).
    pub port_name: String,

    /// Baud rate.
    #[serde(default)]
    pub baud_rate: BaudRate,

    /// Data bits per character.
    #[serde(default)]
    pub data_bits: DataBits,

    /// Parity mode.
    #[serde(default)]
    pub parity: Parity,

    /// Stop bits.
    #[serde(default)]
    pub stop_bits: StopBits,

    /// Timeout of a single physical read in milliseconds. A read that sees
    /// no data within this window returns zero bytes.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Optional label / description.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_read_timeout() -> u64 {
    100
}
fn default_write_timeout() -> u64 {
    1000
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: BaudRate::default(),
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            label: None,
        }
    }
}

impl SerialConfig {
    /// Config for `port_name` with every other field at its default.
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Shorthand notation (e.g. "115200-8N1").
    pub fn shorthand(&self) -> String {
        format!(
            "{}-{}{}{}",
            self.baud_rate.value(),
            self.data_bits.value(),
            self.parity.label(),
            self.stop_bits.label()
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Information
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Information about a discovered serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortInfo {
    /// System port name (e.g. `COM3`, `/dev/ttyACM0`).
    pub port_name: String,

    /// Port type.
    pub port_type: PortType,

    /// Product string reported by the USB descriptor.
    pub description: Option<String>,

    /// Manufacturer string.
    pub manufacturer: Option<String>,

    /// USB Vendor ID (if USB-serial adapter).
    pub vid: Option<u16>,

    /// USB Product ID (if USB-serial adapter).
    pub pid: Option<u16>,

    /// USB serial number.
    pub serial_number: Option<String>,

    /// Friendly / display name.
    pub display_name: String,
}

/// Type of serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortType {
    /// USB to serial adapter or native USB CDC.
    UsbSerial,
    /// Native / built-in serial port.
    Native,
    /// Bluetooth serial profile (RFCOMM).
    Bluetooth,
    /// Virtual / pseudo-terminal pair.
    Virtual,
    /// Unknown type.
    Unknown,
}

impl PortType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UsbSerial => "USB-Serial",
            Self::Native => "Native",
            Self::Bluetooth => "Bluetooth",
            Self::Virtual => "Virtual",
            Self::Unknown => "Unknown",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Device families
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Family of board / firmware a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceFamily {
    MicroBit,
    Esp,
    Pico,
    CircuitPython,
    Pyboard,
    Snek,
    Generic,
}

impl Default for DeviceFamily {
    fn default() -> Self {
        Self::Generic
    }
}

impl DeviceFamily {
    pub fn label(&self) -> &'static str {
        match self {
            Self::MicroBit => "BBC micro:bit",
            Self::Esp => "ESP MicroPython",
            Self::Pico => "Raspberry Pi Pico",
            Self::CircuitPython => "CircuitPython",
            Self::Pyboard => "Pyboard",
            Self::Snek => "Snek",
            Self::Generic => "MicroPython",
        }
    }

    /// Raw REPL settings this family is known to need.
    pub fn raw_repl_defaults(&self) -> RawReplConfig {
        match self {
            // The micro:bit needs several interrupts to break out of a
            // running program and a soft reboot to get a clean heap.
            Self::MicroBit => RawReplConfig {
                interrupt_count: 3,
                soft_reboot: true,
                ..Default::default()
            },
            _ => RawReplConfig::default(),
        }
    }

    /// Whether writes must go through the ENQ/ACK windowed transport.
    pub fn needs_flow_control(&self) -> bool {
        matches!(self, Self::Snek)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Raw REPL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for entering raw mode and executing commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReplConfig {
    /// Number of Ctrl-C bytes sent before waiting for the prompt.
    #[serde(default = "default_interrupt_count")]
    pub interrupt_count: u8,

    /// Send Ctrl-B first in case a previous session left raw mode active.
    #[serde(default = "default_true")]
    pub exit_stale_raw: bool,

    /// Soft-reboot the device once raw mode is entered.
    #[serde(default)]
    pub soft_reboot: bool,

    /// Size of each physical write when sending command text.
    #[serde(default = "default_command_chunk")]
    pub command_chunk_size: usize,

    /// Pause between command slices, in milliseconds.
    #[serde(default = "default_chunk_delay")]
    pub chunk_delay_ms: u64,

    /// Deadline for each expected marker, in milliseconds.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

fn default_interrupt_count() -> u8 {
    1
}
fn default_true() -> bool {
    true
}
fn default_command_chunk() -> usize {
    32
}
fn default_chunk_delay() -> u64 {
    10
}
fn default_response_timeout() -> u64 {
    2000
}

impl Default for RawReplConfig {
    fn default() -> Self {
        Self {
            interrupt_count: default_interrupt_count(),
            exit_stale_raw: true,
            soft_reboot: false,
            command_chunk_size: default_command_chunk(),
            chunk_delay_ms: default_chunk_delay(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Flow control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the ENQ/ACK windowed transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowControlConfig {
    /// Bytes sent before an ENQ must be acknowledged.
    #[serde(default = "default_window")]
    pub window_size: usize,

    /// Baud rates probed on open, in order. The first is the fallback.
    #[serde(default = "default_candidate_bauds")]
    pub candidate_bauds: Vec<u32>,

    /// How long to wait for the autobaud answer at each rate.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_window() -> usize {
    16
}
fn default_candidate_bauds() -> Vec<u32> {
    vec![115200, 57600]
}
fn default_probe_timeout() -> u64 {
    250
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            window_size: default_window(),
            candidate_bauds: default_candidate_bauds(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_value_roundtrip() {
        for rate in [9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600] {
            assert_eq!(BaudRate::from_value(rate).value(), rate);
        }
        assert_eq!(BaudRate::from_value(250000), BaudRate::Custom(250000));
    }

    #[test]
    fn test_config_shorthand() {
        let cfg = SerialConfig::for_port("/dev/ttyACM0");
        assert_eq!(cfg.shorthand(), "115200-8N1");
    }

    #[test]
    fn test_config_shorthand_7e2() {
        let cfg = SerialConfig {
            port_name: "COM1".to_string(),
            baud_rate: BaudRate::Baud57600,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            stop_bits: StopBits::Two,
            ..Default::default()
        };
        assert_eq!(cfg.shorthand(), "57600-7E2");
    }

    #[test]
    fn test_serial_config_defaults_from_json() {
        let cfg: SerialConfig = serde_json::from_str(r#"{"portName":"COM4"}"#).unwrap();
        assert_eq!(cfg.port_name, "COM4");
        assert_eq!(cfg.baud_rate, BaudRate::Baud115200);
        assert_eq!(cfg.parity, Parity::None);
        assert_eq!(cfg.read_timeout_ms, 100);
    }

    #[test]
    fn test_raw_repl_config_defaults() {
        let cfg = RawReplConfig::default();
        assert_eq!(cfg.interrupt_count, 1);
        assert!(cfg.exit_stale_raw);
        assert!(!cfg.soft_reboot);
        assert_eq!(cfg.command_chunk_size, 32);
        assert_eq!(cfg.response_timeout_ms, 2000);

        let parsed: RawReplConfig = serde_json::from_str(r#"{"softReboot":true}"#).unwrap();
        assert!(parsed.soft_reboot);
        assert_eq!(parsed.chunk_delay_ms, 10);
    }

    #[test]
    fn test_family_defaults() {
        let microbit = DeviceFamily::MicroBit.raw_repl_defaults();
        assert_eq!(microbit.interrupt_count, 3);
        assert!(microbit.soft_reboot);
        assert!(!DeviceFamily::Pico.raw_repl_defaults().soft_reboot);
        assert!(DeviceFamily::Snek.needs_flow_control());
        assert!(!DeviceFamily::Esp.needs_flow_control());
    }

    #[test]
    fn test_flow_control_defaults() {
        let cfg = FlowControlConfig::default();
        assert_eq!(cfg.window_size, 16);
        assert_eq!(cfg.candidate_bauds, vec![115200, 57600]);
    }

    #[test]
    fn test_port_type_label() {
        assert_eq!(PortType::UsbSerial.label(), "USB-Serial");
        assert_eq!(PortType::Bluetooth.label(), "Bluetooth");
    }
}
