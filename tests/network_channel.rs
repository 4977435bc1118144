use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use datachannel::{
    Channel, ClientConfig, Error, NetworkClient, NetworkServer, ServerConfig,
};

const WAIT: Duration = Duration::from_secs(5);

fn local_server() -> NetworkServer {
    NetworkServer::bind_with_config(ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    })
    .expect("bind server")
}

fn fast_client(port: u16) -> NetworkClient {
    NetworkClient::connect_with_config(
        ClientConfig::new("127.0.0.1", port).with_retries(5, Duration::from_millis(20)),
    )
    .expect("connect client")
}

fn wait_for_connections(server: &NetworkServer, count: usize) {
    let deadline = Instant::now() + WAIT;
    while server.connection_count() != count {
        assert!(
            Instant::now() < deadline,
            "expected {count} connections, have {}",
            server.connection_count()
        );
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn client_to_server_round_trip_in_order() {
    let server = local_server();
    let client = fast_client(server.local_addr().port());

    for i in 0..20 {
        client.send(format!("{{\"seq\":{i}}}").as_bytes()).expect("send");
    }
    for i in 0..20 {
        let msg = server.receive().expect("receive").expect("message");
        assert_eq!(msg, format!("{{\"seq\":{i}}}").into_bytes());
    }
}

#[test]
fn server_broadcasts_to_every_client() {
    let server = local_server();
    let port = server.local_addr().port();
    let clients: Vec<_> = (0..3).map(|_| fast_client(port)).collect();
    wait_for_connections(&server, 3);

    server.send(b"m1").expect("send m1");
    server.send(b"m2").expect("send m2");

    for client in &clients {
        assert_eq!(client.receive().expect("m1"), Some(b"m1".to_vec()));
        assert_eq!(client.receive().expect("m2"), Some(b"m2".to_vec()));
    }
}

#[test]
fn broadcast_drops_disconnected_clients() {
    let server = local_server();
    let port = server.local_addr().port();
    let stays = fast_client(port);
    let leaves = fast_client(port);
    wait_for_connections(&server, 2);

    leaves.close().expect("close client");
    wait_for_connections(&server, 1);

    server.send(b"still here").expect("broadcast");
    assert_eq!(stays.receive().expect("receive"), Some(b"still here".to_vec()));
}

#[test]
fn broadcast_survives_a_peer_that_vanished() {
    let server = local_server();
    let port = server.local_addr().port();
    let live = fast_client(port);
    let doomed = TcpStream::connect(("127.0.0.1", port)).expect("raw peer");
    wait_for_connections(&server, 2);

    drop(doomed);
    for i in 0..10 {
        server.send(format!("tick-{i}").as_bytes()).expect("broadcast");
    }

    for i in 0..10 {
        let msg = live.receive().expect("receive").expect("message");
        assert_eq!(msg, format!("tick-{i}").into_bytes());
    }
    wait_for_connections(&server, 1);
}

#[test]
fn send_reaches_restarted_server() {
    let server = local_server();
    let port = server.local_addr().port();
    let client = fast_client(port);
    client.send(b"before").expect("send before");
    assert_eq!(server.receive().expect("before"), Some(b"before".to_vec()));

    server.close().expect("close first server");
    // Let the server's FIN land before the client writes again.
    thread::sleep(Duration::from_millis(50));
    let restarted = NetworkServer::bind_with_config(ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
    })
    .expect("rebind");

    client.send(b"after").expect("send after restart");
    wait_for_connections(&restarted, 1);
    assert_eq!(restarted.receive().expect("after"), Some(b"after".to_vec()));
}

#[test]
fn closed_server_stops_listening() {
    let server = local_server();
    let port = server.local_addr().port();
    server.close().expect("close");
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}

#[test]
fn send_reconnects_after_connection_loss() {
    let server = local_server();
    let client = fast_client(server.local_addr().port());
    client.send(b"before").expect("send before");
    assert_eq!(server.receive().expect("before"), Some(b"before".to_vec()));

    client.reset_connection().expect("reset");
    client.send(b"after").expect("send after reset");
    assert_eq!(server.receive().expect("after"), Some(b"after".to_vec()));
    assert!(!client.is_closed());
}

#[test]
fn receive_reconnects_after_server_restart() {
    let server = local_server();
    let port = server.local_addr().port();
    let client = Arc::new(fast_client(port));
    wait_for_connections(&server, 1);

    let receiver = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.receive())
    };
    server.close().expect("close first server");

    let restarted = NetworkServer::bind_with_config(ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
    })
    .expect("rebind");
    wait_for_connections(&restarted, 1);
    restarted.send(b"welcome back").expect("send");

    let msg = receiver.join().expect("receiver thread").expect("receive");
    assert_eq!(msg, Some(b"welcome back".to_vec()));
}

#[test]
fn unreachable_server_exhausts_retries() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("probe");
        listener.local_addr().expect("addr").port()
    };
    let result = NetworkClient::connect_with_config(
        ClientConfig::new("127.0.0.1", port).with_retries(1, Duration::from_millis(10)),
    );
    match result {
        Err(Error::ConnectionExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[test]
fn newline_payloads_are_rejected() {
    let server = local_server();
    let client = fast_client(server.local_addr().port());
    assert!(matches!(
        client.send(b"two\nlines"),
        Err(Error::InvalidMessage(_))
    ));
    assert!(matches!(
        server.send(b"two\nlines"),
        Err(Error::InvalidMessage(_))
    ));
}

#[test]
fn closed_endpoints_reject_operations() {
    let server = local_server();
    let client = fast_client(server.local_addr().port());

    client.close().expect("close client");
    assert!(matches!(client.send(b"late"), Err(Error::ChannelClosed)));
    assert!(matches!(client.receive(), Err(Error::ChannelClosed)));

    server.close().expect("close server");
    server.close().expect("second close");
    assert!(matches!(server.send(b"late"), Err(Error::ChannelClosed)));
    assert!(matches!(server.receive(), Err(Error::ChannelClosed)));
}

#[test]
fn close_unblocks_parked_client_receive() {
    let server = local_server();
    let client = Arc::new(fast_client(server.local_addr().port()));
    let receiver = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.receive())
    };
    thread::sleep(Duration::from_millis(50));
    client.close().expect("close");

    let result = receiver.join().expect("receiver thread");
    assert!(matches!(result, Err(Error::ChannelClosed)));
}
