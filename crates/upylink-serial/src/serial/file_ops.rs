//! File operations on the device.
//!
//! Each operation generates a short Python program, runs it through one raw
//! REPL session and interprets stdout. File content travels as `b'...'`
//! literals on the way in and as raw UART bytes on the way out.

use crate::serial::error::ReplResult;
use crate::serial::literal::{encode_bytes_literal, encode_str_literal, parse_string_list, parse_uname};
use crate::serial::raw_repl;
use crate::serial::transport::PortHandle;
use crate::serial::types::RawReplConfig;
use std::collections::BTreeMap;

/// Bytes of file content per `f(b'...')` upload command.
pub const PUT_CHUNK_SIZE: usize = 64;
/// Bytes the device reads per loop iteration while streaming a file back.
pub const GET_CHUNK_SIZE: usize = 32;
/// UART speed used by the read snippet when it has to open UART 0 itself.
const UART_BAUD: u32 = 115200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Command builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn list_commands() -> Vec<String> {
    vec!["import os".to_string(), "print(os.listdir())".to_string()]
}

pub fn delete_commands(remote_name: &str) -> Vec<String> {
    vec![
        "import os".to_string(),
        format!("os.remove({})", encode_str_literal(remote_name)),
    ]
}

pub fn version_commands() -> Vec<String> {
    vec!["import os".to_string(), "print(os.uname())".to_string()]
}

/// Open `remote_name` for writing and send `data` in 64-byte literals.
pub fn write_commands(data: &[u8], remote_name: &str) -> Vec<String> {
    let mut commands = Vec::with_capacity(data.len() / PUT_CHUNK_SIZE + 3);
    commands.push(format!("fd = open({}, 'wb')", encode_str_literal(remote_name)));
    commands.push("f = fd.write".to_string());
    for chunk in data.chunks(PUT_CHUNK_SIZE) {
        commands.push(format!("f({})", encode_bytes_literal(chunk)));
    }
    commands.push("fd.close()".to_string());
    commands
}

/// Find a byte sink on the device, then stream `remote_name` into it.
pub fn read_commands(remote_name: &str) -> Vec<String> {
    let uart = [
        "try:".to_string(),
        " from microbit import uart as u".to_string(),
        "except ImportError:".to_string(),
        " try:".to_string(),
        "  from machine import UART".to_string(),
        format!("  u = UART(0, {})", UART_BAUD),
        " except Exception:".to_string(),
        "  try:".to_string(),
        "   from sys import stdout as u".to_string(),
        "  except Exception:".to_string(),
        "   raise Exception('Could not find UART module in device.')".to_string(),
    ]
    .join("\n");
    vec![
        uart,
        format!("f = open({}, 'rb')", encode_str_literal(remote_name)),
        "r = f.read".to_string(),
        "result = True".to_string(),
        format!(
            "while result:\n result = r({})\n if result:\n  u.write(result)\n",
            GET_CHUNK_SIZE
        ),
        "f.close()".to_string(),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-system operations over a borrowed port.
pub struct DeviceFileOps<'a> {
    port: &'a PortHandle,
    config: RawReplConfig,
}

impl<'a> DeviceFileOps<'a> {
    pub fn new(port: &'a PortHandle, config: RawReplConfig) -> Self {
        Self { port, config }
    }

    async fn run(&self, commands: &[String]) -> ReplResult<Vec<u8>> {
        raw_repl::execute(self.port, &self.config, commands).await
    }

    /// Names of the files in the device's working directory.
    pub async fn list(&self) -> ReplResult<Vec<String>> {
        log::debug!("{}: listing files", self.port.port_name());
        let out = self.run(&list_commands()).await?;
        parse_string_list(&String::from_utf8_lossy(&out))
            .map_err(|e| e.with_port(self.port.port_name()))
    }

    /// Raw content of `remote_name`.
    pub async fn read(&self, remote_name: &str) -> ReplResult<Vec<u8>> {
        log::debug!("{}: reading {}", self.port.port_name(), remote_name);
        self.run(&read_commands(remote_name)).await
    }

    /// Create or replace `remote_name` with `data`.
    pub async fn write(&self, data: &[u8], remote_name: &str) -> ReplResult<()> {
        log::debug!(
            "{}: writing {} bytes to {}",
            self.port.port_name(),
            data.len(),
            remote_name
        );
        self.run(&write_commands(data, remote_name)).await.map(|_| ())
    }

    pub async fn delete(&self, remote_name: &str) -> ReplResult<()> {
        log::debug!("{}: deleting {}", self.port.port_name(), remote_name);
        self.run(&delete_commands(remote_name)).await.map(|_| ())
    }

    /// `os.uname()` fields reported by the firmware.
    pub async fn version(&self) -> ReplResult<BTreeMap<String, String>> {
        let out = self.run(&version_commands()).await?;
        parse_uname(&String::from_utf8_lossy(&out)).map_err(|e| e.with_port(self.port.port_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::error::ReplErrorKind;
    use crate::serial::literal::decode_bytes_literal;
    use crate::serial::simulator::SimulatedBoard;
    use crate::serial::types::SerialConfig;
    use std::sync::Arc;

    fn fast_config() -> RawReplConfig {
        RawReplConfig {
            chunk_delay_ms: 0,
            response_timeout_ms: 500,
            ..Default::default()
        }
    }

    async fn board_handle() -> (Arc<SimulatedBoard>, PortHandle) {
        let board = SimulatedBoard::new("sim");
        let handle = PortHandle::open(Arc::clone(&board), &SerialConfig {
            read_timeout_ms: 10,
            ..SerialConfig::for_port("sim")
        })
        .await
        .unwrap();
        (board, handle)
    }

    /// Mixed binary content. 0x04 is left out: read-back streams raw bytes
    /// through the response, where it would end stdout.
    fn payload(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| match (i * 7 % 256) as u8 {
                0x04 => 0x05,
                b => b,
            })
            .collect()
    }

    #[test]
    fn test_write_commands_chunking() {
        for len in [0usize, 1, 63, 64, 65, 1000] {
            let data = payload(len);
            let commands = write_commands(&data, "data.bin");
            assert_eq!(commands[0], "fd = open('data.bin', 'wb')");
            assert_eq!(commands[1], "f = fd.write");
            assert_eq!(commands.last().map(String::as_str), Some("fd.close()"));

            let chunks = &commands[2..commands.len() - 1];
            assert_eq!(chunks.len(), len.div_ceil(PUT_CHUNK_SIZE));
            let mut rebuilt = Vec::new();
            for cmd in chunks {
                let literal = cmd.strip_prefix("f(").and_then(|c| c.strip_suffix(')')).unwrap();
                let bytes = decode_bytes_literal(literal).unwrap();
                assert!(bytes.len() <= PUT_CHUNK_SIZE);
                rebuilt.extend(bytes);
            }
            assert_eq!(rebuilt, data, "len {len}");
        }
    }

    #[test]
    fn test_remote_names_are_escaped() {
        assert_eq!(delete_commands("it's.py")[1], "os.remove('it\\'s.py')");
        assert_eq!(read_commands("a.py")[1], "f = open('a.py', 'rb')");
        assert!(read_commands("a.py")[4].contains("r(32)"));
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (board, handle) = board_handle().await;
        let ops = DeviceFileOps::new(&handle, fast_config());
        for len in [0usize, 1, 63, 64, 65, 1000] {
            let data = payload(len);
            let name = format!("f{}.bin", len);
            ops.write(&data, &name).await.unwrap();
            assert_eq!(board.file(&name).unwrap(), data);
            assert_eq!(ops.read(&name).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (board, handle) = board_handle().await;
        board.add_file("a.py", b"print(1)".to_vec());
        board.add_file("b.py", Vec::new());
        let ops = DeviceFileOps::new(&handle, fast_config());

        assert_eq!(ops.list().await.unwrap(), vec!["a.py", "b.py"]);
        ops.delete("a.py").await.unwrap();
        assert_eq!(ops.list().await.unwrap(), vec!["b.py"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_remote_error() {
        let (_board, handle) = board_handle().await;
        let ops = DeviceFileOps::new(&handle, fast_config());

        let err = ops.read("ghost.py").await.unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::RemoteOperationFailed);
        assert_eq!(err.message, "OSError: [Errno 2] ENOENT");

        let err = ops.delete("ghost.py").await.unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::RemoteOperationFailed);
    }

    #[tokio::test]
    async fn test_list_garbage_is_decode_error() {
        let (board, handle) = board_handle().await;
        let ops = DeviceFileOps::new(&handle, fast_config());
        assert!(ops.list().await.unwrap().is_empty());

        board.fail_commands_containing("listdir", "MemoryError: memory allocation failed");
        let err = ops.list().await.unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::RemoteOperationFailed);
        assert_eq!(err.message, "MemoryError: memory allocation failed");

        let out = raw_repl::execute(&handle, &fast_config(), &["print('not a list')"])
            .await
            .unwrap();
        let err = parse_string_list(&String::from_utf8_lossy(&out)).unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::ProtocolDecodeError);
    }

    #[tokio::test]
    async fn test_version() {
        let (_board, handle) = board_handle().await;
        let ops = DeviceFileOps::new(&handle, fast_config());
        let info = ops.version().await.unwrap();
        assert_eq!(info["sysname"], "simboard");
        assert_eq!(info["release"], "1.19.1");
    }
}
