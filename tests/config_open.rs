#![cfg(feature = "config")]

use std::thread;
use std::time::{Duration, Instant};

use datachannel::{Channel, ChannelConfig, Error};
use tempfile::tempdir;

#[test]
fn json_pipeline_opens_and_forwards() {
    let dir = tempdir().expect("tempdir");
    let log_dir = dir.path().join("normalized");
    let json = format!(
        r#"{{
            "type": "pipeline",
            "stages": [
                {{ "type": "memory", "capacity": 16 }},
                {{ "type": "log", "dir": {:?}, "cursor": "reader", "segment_size": 65536 }}
            ]
        }}"#,
        log_dir.display().to_string()
    );
    let config_path = dir.path().join("channel.json");
    std::fs::write(&config_path, json).expect("write config");

    let channel = ChannelConfig::load(&config_path)
        .expect("load")
        .open()
        .expect("open");
    channel.send(b"{\"ask\":42.5}").expect("send");

    let deadline = Instant::now() + Duration::from_secs(5);
    let msg = loop {
        if let Some(msg) = channel.receive().expect("receive") {
            break msg;
        }
        assert!(Instant::now() < deadline, "message never reached the log");
        thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(msg, b"{\"ask\":42.5}");
    assert!(log_dir.join("000000000.q").exists());
    channel.close().expect("close");
}

#[test]
fn invalid_config_file_names_the_path() {
    let dir = tempdir().expect("tempdir");
    let config_path = dir.path().join("broken.json");
    std::fs::write(&config_path, r#"{ "type": "memory", "capacity": "lots" }"#)
        .expect("write config");

    match ChannelConfig::load(&config_path) {
        Err(Error::Configuration(msg)) => assert!(msg.contains("broken.json"), "{msg}"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn undersized_log_segment_fails_to_open() {
    let dir = tempdir().expect("tempdir");
    let config = ChannelConfig::Log {
        dir: dir.path().join("tiny"),
        cursor: None,
        segment_size: 512,
    };
    assert!(matches!(config.open(), Err(Error::Configuration(_))));
}
