//! Serial port discovery and board matching.
//!
//! Enumerates the ports the OS reports, classifies them and matches USB
//! ports against a `BoardRegistry` of vendor/product ids to tell which
//! device family is attached.

use crate::serial::error::{ReplError, ReplResult};
use crate::serial::types::*;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Known boards
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A USB id that identifies a board family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownBoard {
    pub vid: u16,
    /// `None` matches every product of the vendor.
    #[serde(default)]
    pub pid: Option<u16>,
    /// Required manufacturer string, for ids shared between vendors.
    #[serde(default)]
    pub manufacturer: Option<String>,
    pub name: String,
    #[serde(default)]
    pub family: DeviceFamily,
}

impl KnownBoard {
    pub fn new(vid: u16, pid: Option<u16>, name: impl Into<String>, family: DeviceFamily) -> Self {
        Self {
            vid,
            pid,
            manufacturer: None,
            name: name.into(),
            family,
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn matches(&self, port: &SerialPortInfo) -> bool {
        if port.vid != Some(self.vid) {
            return false;
        }
        if let Some(pid) = self.pid {
            if port.pid != Some(pid) {
                return false;
            }
        }
        match &self.manufacturer {
            Some(m) => port.manufacturer.as_deref() == Some(m.as_str()),
            None => true,
        }
    }

    /// Higher is more specific.
    fn specificity(&self) -> u8 {
        u8::from(self.pid.is_some()) + 2 * u8::from(self.manufacturer.is_some())
    }
}

/// Lookup table from USB ids to board families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardRegistry {
    boards: Vec<KnownBoard>,
}

impl BoardRegistry {
    pub fn empty() -> Self {
        Self { boards: Vec::new() }
    }

    pub fn add(&mut self, board: KnownBoard) {
        self.boards.push(board);
    }

    pub fn boards(&self) -> &[KnownBoard] {
        &self.boards
    }

    /// The most specific board matching `port`; earlier entries win ties.
    pub fn match_port(&self, port: &SerialPortInfo) -> Option<&KnownBoard> {
        let mut best: Option<&KnownBoard> = None;
        for board in self.boards.iter().filter(|b| b.matches(port)) {
            if best.map_or(true, |b| board.specificity() > b.specificity()) {
                best = Some(board);
            }
        }
        best
    }
}

impl Default for BoardRegistry {
    /// Boards the tool knows about out of the box.
    fn default() -> Self {
        use DeviceFamily::*;
        let mut r = Self::empty();

        r.add(KnownBoard::new(0x0D28, Some(0x0204), "BBC micro:bit", MicroBit));

        r.add(KnownBoard::new(0x1A86, Some(0x7523), "ESP (CH340)", Esp));
        r.add(KnownBoard::new(0x10C4, Some(0xEA60), "ESP (CP210x)", Esp));
        r.add(KnownBoard::new(0x0403, Some(0x6001), "M5Stack", Esp).with_manufacturer("M5STACK Inc."));
        for pid in [0x6001, 0x6010, 0x6011, 0x6014, 0x6015, 0x601C] {
            r.add(KnownBoard::new(0x0403, Some(pid), "ESP (FTDI)", Esp));
        }

        r.add(KnownBoard::new(0x2E8A, Some(0x0005), "Raspberry Pi Pico", Pico));

        for pid in [
            0x8015, 0x8023, 0x801B, 0x8014, 0x8019, 0x801D, 0x801F, 0x8012, 0x8021, 0x8025,
            0x8026, 0x8028, 0x802A, 0x802C, 0x802E, 0xD1ED,
        ] {
            r.add(KnownBoard::new(0x239A, Some(pid), "Adafruit CircuitPython", CircuitPython));
        }

        r.add(KnownBoard::new(0xF055, Some(0x9800), "Pyboard", Pyboard));
        r.add(KnownBoard::new(0xF055, Some(0x9802), "Pyboard", Pyboard));

        r.add(KnownBoard::new(0xFFFE, None, "Snek", Snek));
        for pid in [0x8022, 0x8011, 0x8013, 0x8018, 0x804D] {
            r.add(KnownBoard::new(0x239A, Some(pid), "Snek (Adafruit)", Snek));
        }
        r.add(KnownBoard::new(0x1366, Some(0x1051), "Snek (Segger)", Snek));
        for pid in [0x8057, 0x0010, 0x0058, 0x0043] {
            r.add(KnownBoard::new(0x2341, Some(pid), "Snek (Arduino)", Snek));
        }
        r.add(KnownBoard::new(0x03EB, Some(0x204B), "Snek (LUFA)", Snek));
        r.add(KnownBoard::new(0x2886, Some(0x002E), "Snek (Seeed)", Snek));

        r
    }
}

/// A connected port and the board it was matched to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedBoard {
    pub port: SerialPortInfo,
    pub board: KnownBoard,
}

/// Every port in `ports` that matches a known board, in port order.
pub fn match_ports(registry: &BoardRegistry, ports: &[SerialPortInfo]) -> Vec<DetectedBoard> {
    ports
        .iter()
        .filter_map(|port| {
            registry.match_port(port).map(|board| DetectedBoard {
                port: port.clone(),
                board: board.clone(),
            })
        })
        .collect()
}

/// First connected port that matches a known board.
pub fn find_device(registry: &BoardRegistry, ports: &[SerialPortInfo]) -> Option<DetectedBoard> {
    let found = match_ports(registry, ports).into_iter().next();
    match &found {
        Some(d) => log::info!("Found {} on {}", d.board.name, d.port.port_name),
        None => log::debug!("No known board among {} port(s)", ports.len()),
    }
    found
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Scanner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scanner filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
    /// Filter by port name substring (e.g. "COM", "/dev/ttyACM").
    #[serde(default)]
    pub name_filter: Option<String>,

    /// Filter by USB VID.
    #[serde(default)]
    pub vid_filter: Option<u16>,

    /// Include virtual / pseudo-terminal ports.
    #[serde(default = "default_true")]
    pub include_virtual: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            name_filter: None,
            vid_filter: None,
            include_virtual: true,
        }
    }
}

/// Generate a display name for a discovered port.
pub fn generate_display_name(registry: &BoardRegistry, port: &SerialPortInfo) -> String {
    if let Some(board) = registry.match_port(port) {
        return format!("{} - {}", port.port_name, board.name);
    }
    if let Some(ref desc) = port.description {
        if !desc.is_empty() {
            return format!("{} - {}", port.port_name, desc);
        }
    }
    port.port_name.clone()
}

/// Classify a port name into a PortType.
pub fn classify_port(port_name: &str) -> PortType {
    let lower = port_name.to_lowercase();
    if lower.contains("usb") || lower.contains("acm") {
        PortType::UsbSerial
    } else if lower.contains("bluetooth") || lower.contains("rfcomm") {
        PortType::Bluetooth
    } else if lower.contains("pts") || lower.contains("pty") {
        PortType::Virtual
    } else if lower.starts_with("com") || lower.starts_with("/dev/ttys") {
        PortType::Native
    } else {
        PortType::Unknown
    }
}

/// Create a `SerialPortInfo` from basic information.
pub fn build_port_info(
    registry: &BoardRegistry,
    port_name: &str,
    vid: Option<u16>,
    pid: Option<u16>,
    description: Option<&str>,
    manufacturer: Option<&str>,
    serial_number: Option<&str>,
) -> SerialPortInfo {
    let port_type = if vid.is_some() {
        PortType::UsbSerial
    } else {
        classify_port(port_name)
    };

    let mut info = SerialPortInfo {
        port_name: port_name.to_string(),
        port_type,
        description: description.map(|s| s.to_string()),
        manufacturer: manufacturer.map(|s| s.to_string()),
        vid,
        pid,
        serial_number: serial_number.map(|s| s.to_string()),
        display_name: String::new(),
    };
    info.display_name = generate_display_name(registry, &info);
    info
}

/// Apply scan filters to a list of ports.
pub fn apply_filters(ports: Vec<SerialPortInfo>, options: &ScanOptions) -> Vec<SerialPortInfo> {
    ports
        .into_iter()
        .filter(|p| {
            if let Some(ref filter) = options.name_filter {
                if !p.port_name.to_lowercase().contains(&filter.to_lowercase()) {
                    return false;
                }
            }
            if let Some(vid) = options.vid_filter {
                if p.vid != Some(vid) {
                    return false;
                }
            }
            !(!options.include_virtual && p.port_type == PortType::Virtual)
        })
        .collect()
}

fn from_system(registry: &BoardRegistry, port: serialport::SerialPortInfo) -> SerialPortInfo {
    match port.port_type {
        serialport::SerialPortType::UsbPort(usb) => build_port_info(
            registry,
            &port.port_name,
            Some(usb.vid),
            Some(usb.pid),
            usb.product.as_deref(),
            usb.manufacturer.as_deref(),
            usb.serial_number.as_deref(),
        ),
        serialport::SerialPortType::BluetoothPort => {
            let mut info = build_port_info(registry, &port.port_name, None, None, None, None, None);
            info.port_type = PortType::Bluetooth;
            info
        }
        _ => build_port_info(registry, &port.port_name, None, None, None, None, None),
    }
}

/// Enumerate the serial ports the OS reports.
pub async fn scan_ports(registry: &BoardRegistry, options: &ScanOptions) -> ReplResult<Vec<SerialPortInfo>> {
    let started = std::time::Instant::now();
    let found = tokio::task::spawn_blocking(serialport::available_ports)
        .await
        .map_err(|e| ReplError::port_unavailable(format!("Port scan task failed: {}", e)))??;

    let ports: Vec<SerialPortInfo> = found.into_iter().map(|p| from_system(registry, p)).collect();
    let ports = apply_filters(ports, options);
    log::debug!(
        "Found {} serial port(s) in {} ms",
        ports.len(),
        started.elapsed().as_millis()
    );
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16, manufacturer: Option<&str>) -> SerialPortInfo {
        build_port_info(
            &BoardRegistry::default(),
            name,
            Some(vid),
            Some(pid),
            None,
            manufacturer,
            None,
        )
    }

    #[test]
    fn test_default_registry_families() {
        let r = BoardRegistry::default();
        let family = |vid, pid| r.match_port(&usb("p", vid, pid, None)).map(|b| b.family);
        assert_eq!(family(0x0D28, 0x0204), Some(DeviceFamily::MicroBit));
        assert_eq!(family(0x1A86, 0x7523), Some(DeviceFamily::Esp));
        assert_eq!(family(0x0403, 0x601C), Some(DeviceFamily::Esp));
        assert_eq!(family(0x2E8A, 0x0005), Some(DeviceFamily::Pico));
        assert_eq!(family(0x239A, 0x8015), Some(DeviceFamily::CircuitPython));
        assert_eq!(family(0x239A, 0x8022), Some(DeviceFamily::Snek));
        assert_eq!(family(0xF055, 0x9800), Some(DeviceFamily::Pyboard));
        assert_eq!(family(0x0D28, 0x9999), None);
    }

    #[test]
    fn test_vendor_wide_entry() {
        let r = BoardRegistry::default();
        let board = r.match_port(&usb("p", 0xFFFE, 0x1234, None)).unwrap();
        assert_eq!(board.family, DeviceFamily::Snek);
    }

    #[test]
    fn test_manufacturer_entry_is_preferred() {
        let r = BoardRegistry::default();
        let m5 = r.match_port(&usb("p", 0x0403, 0x6001, Some("M5STACK Inc."))).unwrap();
        assert_eq!(m5.name, "M5Stack");
        let ftdi = r.match_port(&usb("p", 0x0403, 0x6001, Some("FTDI"))).unwrap();
        assert_eq!(ftdi.name, "ESP (FTDI)");
    }

    #[test]
    fn test_ports_without_usb_ids_never_match() {
        let r = BoardRegistry::default();
        let native = build_port_info(&r, "/dev/ttyS0", None, None, None, None, None);
        assert!(r.match_port(&native).is_none());
        assert_eq!(native.port_type, PortType::Native);
    }

    #[test]
    fn test_find_device_picks_first_match() {
        let r = BoardRegistry::default();
        let ports = vec![
            build_port_info(&r, "/dev/ttyS0", None, None, None, None, None),
            usb("/dev/ttyACM0", 0x2E8A, 0x0005, None),
            usb("/dev/ttyACM1", 0x0D28, 0x0204, None),
        ];
        let found = find_device(&r, &ports).unwrap();
        assert_eq!(found.port.port_name, "/dev/ttyACM0");
        assert_eq!(found.board.family, DeviceFamily::Pico);
        assert_eq!(match_ports(&r, &ports).len(), 2);
        assert!(find_device(&r, &ports[..1]).is_none());
    }

    #[test]
    fn test_registry_extension() {
        let mut r = BoardRegistry::empty();
        let port = usb("COM7", 0x1234, 0x5678, None);
        assert!(r.match_port(&port).is_none());
        r.add(KnownBoard::new(0x1234, None, "Custom", DeviceFamily::Generic));
        assert_eq!(r.match_port(&port).unwrap().name, "Custom");
    }

    #[test]
    fn test_known_board_from_json() {
        let board: KnownBoard =
            serde_json::from_str(r#"{"vid": 4660, "name": "Lab board"}"#).unwrap();
        assert_eq!(board.pid, None);
        assert_eq!(board.family, DeviceFamily::Generic);
    }

    #[test]
    fn test_display_name() {
        let info = usb("COM3", 0x0D28, 0x0204, None);
        assert_eq!(info.display_name, "COM3 - BBC micro:bit");
        let r = BoardRegistry::default();
        let info = build_port_info(&r, "COM5", None, None, Some("My Device"), None, None);
        assert_eq!(info.display_name, "COM5 - My Device");
        let info = build_port_info(&r, "COM1", None, None, None, None, None);
        assert_eq!(info.display_name, "COM1");
    }

    #[test]
    fn test_classify_port() {
        assert_eq!(classify_port("/dev/ttyUSB0"), PortType::UsbSerial);
        assert_eq!(classify_port("/dev/ttyACM0"), PortType::UsbSerial);
        assert_eq!(classify_port("COM1"), PortType::Native);
        assert_eq!(classify_port("/dev/rfcomm0"), PortType::Bluetooth);
        assert_eq!(classify_port("/dev/pts/3"), PortType::Virtual);
    }

    #[test]
    fn test_apply_filters() {
        let r = BoardRegistry::default();
        let ports = vec![
            usb("/dev/ttyACM0", 0x2E8A, 0x0005, None),
            usb("/dev/ttyUSB0", 0x1A86, 0x7523, None),
            build_port_info(&r, "/dev/pts/2", None, None, None, None, None),
        ];
        let opts = ScanOptions {
            vid_filter: Some(0x2E8A),
            ..Default::default()
        };
        assert_eq!(apply_filters(ports.clone(), &opts).len(), 1);
        let opts = ScanOptions {
            include_virtual: false,
            ..Default::default()
        };
        assert_eq!(apply_filters(ports.clone(), &opts).len(), 2);
        let opts = ScanOptions {
            name_filter: Some("usb".to_string()),
            ..Default::default()
        };
        assert_eq!(apply_filters(ports, &opts)[0].port_name, "/dev/ttyUSB0");
    }
}
