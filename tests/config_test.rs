use upylink_app::config::LinkConfig;
use upylink_serial::serial::port_scanner::{build_port_info, KnownBoard};
use upylink_serial::serial::{DeviceFamily, ReplErrorKind};

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let config = LinkConfig {
        port: Some("/dev/ttyACM0".to_string()),
        family: Some(DeviceFamily::Pico),
        extra_boards: vec![KnownBoard::new(0x1209, Some(0x7777), "Lab board", DeviceFamily::Generic)],
        ..Default::default()
    };
    config.save(&path).unwrap();

    let loaded = LinkConfig::load(&path).unwrap();
    assert_eq!(loaded.port.as_deref(), Some("/dev/ttyACM0"));
    assert_eq!(loaded.family, Some(DeviceFamily::Pico));
    assert_eq!(loaded.extra_boards.len(), 1);
}

#[test]
fn test_extra_boards_join_registry() {
    let config: LinkConfig = serde_json::from_str(
        r#"{"extraBoards": [{"vid": 4617, "pid": 30583, "name": "Lab board", "family": "esp"}]}"#,
    )
    .unwrap();
    let registry = config.registry();
    let port = build_port_info(&registry, "/dev/ttyUSB3", Some(0x1209), Some(0x7777), None, None, None);
    let board = registry.match_port(&port).unwrap();
    assert_eq!(board.name, "Lab board");
    assert_eq!(board.family, DeviceFamily::Esp);
    // Built-in boards are still known.
    let pico = build_port_info(&registry, "/dev/ttyACM0", Some(0x2E8A), Some(0x0005), None, None, None);
    assert_eq!(registry.match_port(&pico).unwrap().family, DeviceFamily::Pico);
}

#[test]
fn test_bad_files_are_local_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("none.json");
    assert_eq!(LinkConfig::load(&missing).unwrap_err().kind, ReplErrorKind::LocalIo);
    assert_eq!(
        LinkConfig::load_or_default(Some(&missing)).unwrap_err().kind,
        ReplErrorKind::LocalIo
    );

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, "{ not json").unwrap();
    let err = LinkConfig::load(&broken).unwrap_err();
    assert!(err.message.starts_with("Invalid config"));
}
