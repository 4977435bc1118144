use std::sync::Arc;
use std::thread;
use std::time::Duration;

use datachannel::{Channel, Error, MemoryChannel, POISON_PILL};

#[test]
fn round_trip_preserves_bytes() {
    let channel = MemoryChannel::unbounded();
    channel.send(b"{\"px\":101.5}").expect("send");
    let msg = channel.receive().expect("receive").expect("message");
    assert_eq!(msg, b"{\"px\":101.5}");
}

#[test]
fn messages_arrive_in_send_order() {
    let channel = MemoryChannel::bounded(64).expect("bounded");
    for i in 0..50 {
        channel.send(format!("tick-{i}").as_bytes()).expect("send");
    }
    for i in 0..50 {
        let msg = channel.receive().expect("receive").expect("message");
        assert_eq!(msg, format!("tick-{i}").into_bytes());
    }
}

#[test]
fn poison_pill_is_an_ordinary_payload() {
    let channel = MemoryChannel::unbounded();
    channel.send(POISON_PILL).expect("send");
    assert_eq!(channel.receive().expect("receive").as_deref(), Some(POISON_PILL));
    assert!(!channel.is_closed());
}

#[test]
fn send_after_close_is_rejected() {
    let channel = MemoryChannel::unbounded();
    channel.close().expect("close");
    assert!(matches!(channel.send(b"late"), Err(Error::ChannelClosed)));
}

#[test]
fn buffered_messages_drain_after_close() {
    let channel = MemoryChannel::unbounded();
    channel.send(b"a").expect("send a");
    channel.send(b"b").expect("send b");
    channel.close().expect("close");

    assert_eq!(channel.receive().expect("a"), Some(b"a".to_vec()));
    assert_eq!(channel.receive().expect("b"), Some(b"b".to_vec()));
    assert!(matches!(channel.receive(), Err(Error::ChannelClosed)));
}

#[test]
fn close_unblocks_parked_receiver() {
    let channel = Arc::new(MemoryChannel::unbounded());
    let receiver = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || channel.receive())
    };
    thread::sleep(Duration::from_millis(50));
    channel.close().expect("close");

    let result = receiver.join().expect("receiver thread");
    assert!(matches!(result, Err(Error::ChannelClosed)));
}

#[test]
fn close_unblocks_sender_on_full_channel() {
    let channel = Arc::new(MemoryChannel::bounded(1).expect("bounded"));
    channel.send(b"fills the slot").expect("first send");
    let sender = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || channel.send(b"blocked"))
    };
    thread::sleep(Duration::from_millis(50));
    channel.close().expect("close");

    let result = sender.join().expect("sender thread");
    assert!(matches!(result, Err(Error::ChannelClosed)));
}

#[test]
fn full_channel_blocks_until_a_slot_frees() {
    let channel = Arc::new(MemoryChannel::bounded(1).expect("bounded"));
    channel.send(b"first").expect("first send");
    let sender = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || channel.send(b"second"))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(channel.len(), 1);

    assert_eq!(channel.receive().expect("first"), Some(b"first".to_vec()));
    sender.join().expect("sender thread").expect("second send");
    assert_eq!(channel.receive().expect("second"), Some(b"second".to_vec()));
}

#[test]
fn concurrent_producers_keep_per_producer_order() {
    let channel = Arc::new(MemoryChannel::unbounded());
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                for i in 0..100 {
                    channel.send(format!("{p}:{i}").as_bytes()).expect("send");
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer");
    }

    let mut last = [None::<u32>; 4];
    for _ in 0..400 {
        let msg = channel.receive().expect("receive").expect("message");
        let text = String::from_utf8(msg).expect("utf8");
        let (p, i) = text.split_once(':').expect("separator");
        let p: usize = p.parse().expect("producer id");
        let i: u32 = i.parse().expect("index");
        if let Some(prev) = last[p] {
            assert!(i > prev, "producer {p} reordered: {prev} then {i}");
        }
        last[p] = Some(i);
    }
    assert!(channel.is_empty());
}
