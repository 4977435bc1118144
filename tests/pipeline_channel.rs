use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use datachannel::{
    Channel, Error, HopState, LogChannel, LogCursor, MemoryChannel, PipelineChannel, SharedChannel,
};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(5);

fn memory_stages(n: usize) -> Vec<SharedChannel> {
    (0..n)
        .map(|_| Arc::new(MemoryChannel::unbounded()) as SharedChannel)
        .collect()
}

fn poll_receive(channel: &dyn Channel) -> Vec<u8> {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(msg) = channel.receive().expect("receive") {
            return msg;
        }
        assert!(Instant::now() < deadline, "timed out waiting for a message");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn three_memory_stages_are_transparent() {
    let pipeline = PipelineChannel::new(memory_stages(3)).expect("pipeline");
    pipeline.send(b"{\"sym\":\"BTCUSDT\"}").expect("send");
    assert_eq!(
        pipeline.receive().expect("receive"),
        Some(b"{\"sym\":\"BTCUSDT\"}".to_vec())
    );
}

#[test]
fn order_is_preserved_end_to_end() {
    let pipeline = PipelineChannel::new(memory_stages(4)).expect("pipeline");
    for i in 0..200 {
        pipeline.send(format!("q{i}").as_bytes()).expect("send");
    }
    for i in 0..200 {
        let msg = pipeline.receive().expect("receive").expect("message");
        assert_eq!(msg, format!("q{i}").into_bytes());
    }
}

#[test]
fn fewer_than_two_stages_is_a_configuration_error() {
    assert!(matches!(
        PipelineChannel::new(Vec::new()),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        PipelineChannel::new(memory_stages(1)),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn close_closes_every_stage() {
    let stages = memory_stages(3);
    let pipeline = PipelineChannel::new(stages.clone()).expect("pipeline");
    pipeline.close().expect("close");
    pipeline.close().expect("second close");

    assert!(pipeline.is_closed());
    assert!(stages.iter().all(|stage| stage.is_closed()));
    assert!(matches!(pipeline.send(b"late"), Err(Error::ChannelClosed)));
    assert!(pipeline
        .hop_states()
        .iter()
        .all(|state| *state == HopState::Stopped));
}

#[test]
fn failed_hop_stops_without_closing_pipeline() {
    let stages = memory_stages(3);
    let pipeline = PipelineChannel::new(stages.clone()).expect("pipeline");

    stages[1].close().expect("close middle stage");
    pipeline.send(b"lost").expect("first stage still accepts");

    let deadline = Instant::now() + WAIT;
    loop {
        let states = pipeline.hop_states();
        if states
            .iter()
            .all(|state| matches!(state, HopState::Failed(_)))
        {
            break;
        }
        assert!(Instant::now() < deadline, "hops still running: {states:?}");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!pipeline.is_closed());
    assert!(!stages[0].is_closed());
}

#[test]
fn log_stage_feeds_memory_stage() {
    let dir = tempdir().expect("tempdir");
    let log: SharedChannel =
        Arc::new(LogChannel::open(dir.path().join("ingest")).expect("log"));
    let sink: SharedChannel = Arc::new(MemoryChannel::unbounded());
    let pipeline = PipelineChannel::new(vec![log, sink]).expect("pipeline");

    // The forwarder idles on the empty log before anything is sent.
    thread::sleep(Duration::from_millis(20));
    pipeline.send(b"first").expect("send");
    pipeline.send(b"second").expect("send");

    assert_eq!(pipeline.receive().expect("first"), Some(b"first".to_vec()));
    assert_eq!(pipeline.receive().expect("second"), Some(b"second".to_vec()));
    pipeline.close().expect("close");
}

#[test]
fn memory_stage_feeds_durable_log() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("archive");
    let source: SharedChannel = Arc::new(MemoryChannel::unbounded());
    let log: SharedChannel =
        Arc::new(LogChannel::open_named(&path, "archiver").expect("log"));
    let pipeline = PipelineChannel::new(vec![source, log]).expect("pipeline");

    for msg in [&b"a"[..], b"b", b"c"] {
        pipeline.send(msg).expect("send");
    }
    assert_eq!(poll_receive(&pipeline), b"a");
    assert_eq!(poll_receive(&pipeline), b"b");
    assert_eq!(poll_receive(&pipeline), b"c");
    pipeline.close().expect("close");

    let reopened = LogChannel::open_named(&path, "archiver").expect("reopen");
    assert_eq!(reopened.receive().expect("caught up"), None);
    let mut history = LogCursor::from_start(&path).expect("cursor");
    let mut count = 0;
    while history.next().expect("next").is_some() {
        count += 1;
    }
    assert_eq!(count, 3);
}
