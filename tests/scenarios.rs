//! End-to-end scenarios against the public `Node` API (§8), in the shape of the teacher crate's
//! `lib.rs` `it_works`/`soak_test` tests: bind real `Node`s on loopback and drive them with bounded
//! `update()` polling loops rather than mocking the socket.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rudp_link::{ConnectResult, Node};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Binds a server on `server_port` and a client that connects to it, polling both until the
/// handshake completes on each side, then applies `loss_percent` to every link.
fn connected_pair(server_port: u16, loss_percent: u8) -> (Node, Node) {
    let server = Node::new(20, 8);
    server.listen(server_port, "pw", 32).unwrap();
    let client = Node::new(20, 8);

    let connected = Arc::new(Mutex::new(false));
    let accepted = Arc::new(Mutex::new(false));
    {
        let flag = accepted.clone();
        server.on_new_connection(move |_, _, _| *flag.lock().unwrap() = true);
    }
    {
        let flag = connected.clone();
        client.on_connect_result(move |_, result| {
            if result == ConnectResult::Succes {
                *flag.lock().unwrap() = true;
            }
        });
    }
    client.connect("127.0.0.1", server_port, "pw", 8, &[]).unwrap();

    let ok = wait_until(
        || {
            client.update();
            server.update();
            *connected.lock().unwrap() && *accepted.lock().unwrap()
        },
        Duration::from_secs(2),
    );
    assert!(ok, "handshake must complete before a scenario can run");

    if loss_percent > 0 {
        server.simulate_packet_loss(loss_percent);
        client.simulate_packet_loss(loss_percent);
    }

    (server, client)
}

/// §8 scenario: ordered delivery across every channel under heavy loss still arrives, in order,
/// per channel, even though individual datagrams are dropped and must be retransmitted.
#[test]
fn ordered_delivery_survives_heavy_loss_across_all_channels() {
    init_logging();
    let (server, client) = connected_pair(41001, 55);

    let received: Arc<Mutex<Vec<(u8, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        server.on_custom_data(move |_, _, payload, channel| {
            let value = u32::from_be_bytes(payload.try_into().unwrap());
            received.lock().unwrap().push((channel, value));
        });
    }

    const PER_CHANNEL: u32 = 12;
    for channel in 0..rudp_link::NUM_CHANNELS as u8 {
        for i in 0..PER_CHANNEL {
            client.send_reliable_ordered(rudp_link::USER_OFFSET, &i.to_be_bytes(), None, false, channel, false);
        }
    }

    let expected_total = PER_CHANNEL as usize * rudp_link::NUM_CHANNELS;
    let ok = wait_until(
        || {
            client.update();
            server.update();
            received.lock().unwrap().len() >= expected_total
        },
        Duration::from_secs(10),
    );
    assert!(ok, "expected all {expected_total} reliable-ordered sends to arrive despite loss");

    let log = received.lock().unwrap();
    for channel in 0..rudp_link::NUM_CHANNELS as u8 {
        let values: Vec<u32> = log.iter().filter(|(c, _)| *c == channel).map(|(_, v)| *v).collect();
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(values, sorted, "channel {channel} delivered out of order");
        assert_eq!(values.len(), PER_CHANNEL as usize, "channel {channel} lost a reliable message");
    }
}

/// §8 scenario: reliable-newest coalesces to the latest value per item slot rather than delivering
/// every intermediate update, once writes arrive faster than the dispatch interval.
#[test]
fn reliable_newest_coalesces_to_the_latest_value() {
    init_logging();
    let (server, client) = connected_pair(41002, 0);

    let last_seen = Arc::new(AtomicU32::new(0));
    {
        let last_seen = last_seen.clone();
        server.on_custom_data(move |_, _, payload, _| {
            if let Ok(bytes) = <[u8; 4]>::try_from(payload) {
                last_seen.store(u32::from_be_bytes(bytes), Ordering::Release);
            }
        });
    }

    for value in 1..=5_u32 {
        client.send_reliable_newest(rudp_link::USER_OFFSET, 1, 0, &value.to_be_bytes(), None, false);
    }

    let ok = wait_until(
        || {
            client.update();
            server.update();
            last_seen.load(Ordering::Acquire) == 5
        },
        Duration::from_secs(3),
    );
    assert!(ok, "expected the listener to eventually observe the last written value");
}

/// §8 scenario: a keep-alive grace timeout declares the connection lost on the side that keeps
/// polling, even though no explicit `Disconnect` control message was ever sent -- the peer simply
/// stops being driven, so its keep-alive replies stop arriving.
#[test]
fn keep_alive_grace_timeout_declares_the_connection_lost() {
    init_logging();
    let server = Node::new(20, 1);
    server.listen(41003, "pw", 32).unwrap();

    let accepted = Arc::new(Mutex::new(false));
    let lost = Arc::new(Mutex::new(false));
    {
        let flag = accepted.clone();
        server.on_new_connection(move |_, _, _| *flag.lock().unwrap() = true);
    }
    {
        let flag = lost.clone();
        server.on_disconnect(move |_, _, _| *flag.lock().unwrap() = true);
    }

    let client = Node::new(20, 1);
    client.connect("127.0.0.1", 41003, "pw", 8, &[]).unwrap();

    wait_until(
        || {
            client.update();
            server.update();
            *accepted.lock().unwrap()
        },
        Duration::from_secs(2),
    );

    // Stop driving the client entirely from here on: its keep-alive replies go unanswered until
    // the server's grace window elapses.
    let ok = wait_until(
        || {
            server.update();
            *lost.lock().unwrap()
        },
        Duration::from_secs(8),
    );
    assert!(ok, "expected the server to declare the silent peer lost after the keep-alive grace window");
}

/// §8 scenario 5 ("Stale reconnect"): a second connect to an address that was just disconnected is
/// rejected while the old link still lingers, then succeeds once the hub has swept it (<= 2x linger).
#[test]
fn reconnect_to_a_recently_disconnected_endpoint_succeeds_after_sweep() {
    init_logging();
    let server = Node::new(20, 8);
    server.listen(41004, "pw", 32).unwrap();
    let client = Node::new(20, 8);
    let server_endpoint = rudp_link::Endpoint::new(([127, 0, 0, 1], 41004).into());

    let connect_count = Arc::new(AtomicU8::new(0));
    {
        let connect_count = connect_count.clone();
        client.on_connect_result(move |_, result| {
            if result == ConnectResult::Succes {
                connect_count.fetch_add(1, Ordering::Release);
            }
        });
    }

    client.connect("127.0.0.1", 41004, "pw", 8, &[]).unwrap();
    let first_connect_ok = wait_until(
        || {
            client.update();
            server.update();
            connect_count.load(Ordering::Acquire) == 1
        },
        Duration::from_secs(2),
    );
    assert!(first_connect_ok, "initial handshake must complete before the scenario can run");

    client.disconnect(server_endpoint);
    for _ in 0..10 {
        client.update();
        server.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(
        client.is_connection_known(server_endpoint),
        "isConnectionKnown must stay true while the disconnected link lingers"
    );

    let immediate_retry = client.connect("127.0.0.1", 41004, "pw", 8, &[]);
    assert!(
        immediate_retry.is_err(),
        "a reconnect attempted while the old link is still lingering must be rejected"
    );

    let reconnected = wait_until(
        || {
            client.update();
            server.update();
            if connect_count.load(Ordering::Acquire) == 2 {
                return true;
            }
            client.connect("127.0.0.1", 41004, "pw", 8, &[]).is_ok()
        },
        Duration::from_secs(5),
    );
    assert!(reconnected, "reconnect must succeed once the first link has been swept");

    let reconnect_confirmed = wait_until(
        || {
            client.update();
            server.update();
            connect_count.load(Ordering::Acquire) == 2
        },
        Duration::from_secs(2),
    );
    assert!(reconnect_confirmed, "the second handshake must complete after the reconnect is accepted");
}
