//! Node integration tests
//!
//! Real nodes talking over loopback TCP on ephemeral ports. Background mining is off
//! unless a test is about mining, so chain contents are decided by the test.

use peerchain::network::{encode_frame, read_frame};
use peerchain::{
    Block, Blockchain, ChainSelection, LinkState, Message, Node, NodeConfig, Severity,
};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quiet_config() -> NodeConfig {
    NodeConfig {
        initial_difficulty: 1,
        mining_enabled: false,
        resync_interval_secs: 0,
        ..NodeConfig::default()
    }
}

fn start(config: NodeConfig) -> (Node, u16) {
    init_logger();
    let node = Node::new(config).unwrap();
    let port = node.start_node(0).unwrap();
    (node, port)
}

fn mine(node: &Node, count: usize) {
    for i in 0..count {
        let payload = format!("test block {i}");
        assert!(node.mine_block(payload).unwrap().is_some());
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn raw_client(port: u16) -> TcpStream {
    let stream = TcpStream::connect(addr(port)).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

fn send_raw(stream: &mut TcpStream, message: &Message) {
    stream
        .write_all(&encode_frame(&message.encode().unwrap()).unwrap())
        .unwrap();
}

fn receive_raw(stream: &mut TcpStream) -> Message {
    let payload = read_frame(stream, 1 << 24).unwrap().unwrap();
    Message::decode(&payload).unwrap()
}

#[test]
fn test_connect_registers_both_sides_once() {
    let (a, a_port) = start(quiet_config());
    let (b, b_port) = start(quiet_config());

    assert!(a.connect_to_peer("127.0.0.1", b_port));
    assert!(!a.connect_to_peer("127.0.0.1", b_port));
    assert!(wait_until(|| b.peers() == vec![addr(a_port)]));
    assert_eq!(a.peers(), vec![addr(b_port)]);

    // B already knows A through the inbound link
    assert!(!b.connect_to_peer("127.0.0.1", a_port));
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);

    a.stop();
    b.stop();
}

#[test]
fn test_heavier_chain_is_adopted_exactly() {
    let (a, _) = start(quiet_config());
    let (b, b_port) = start(quiet_config());
    mine(&a, 4);
    mine(&b, 7);
    assert_eq!(a.height(), 5);
    assert_eq!(b.height(), 8);

    assert!(a.connect_to_peer("127.0.0.1", b_port));
    assert!(wait_until(|| a.chain_snapshot() == b.chain_snapshot()));
    assert_eq!(a.difficulty(), b.difficulty());
    assert_eq!(a.cumulative_work(), b.cumulative_work());
    assert!(wait_until(
        || a.peer_state(&addr(b_port)) == Some(LinkState::Established)
    ));

    a.stop();
    b.stop();
}

#[test]
fn test_equal_work_keeps_local_chain() {
    let (a, a_port) = start(quiet_config());
    let (b, b_port) = start(quiet_config());
    mine(&a, 2);
    mine(&b, 2);
    let a_before = a.chain_snapshot();
    let b_before = b.chain_snapshot();
    assert_ne!(a_before, b_before);

    assert!(a.connect_to_peer("127.0.0.1", b_port));
    assert!(wait_until(|| {
        a.peer_state(&addr(b_port)) == Some(LinkState::Established)
            && b.peer_state(&addr(a_port)) == Some(LinkState::Established)
    }));

    assert_eq!(a.chain_snapshot(), a_before);
    assert_eq!(b.chain_snapshot(), b_before);
    a.stop();
    b.stop();
}

#[test]
fn test_selection_mode_decides_between_short_heavy_and_long_light() {
    let heavy_config = NodeConfig {
        initial_difficulty: 3,
        ..quiet_config()
    };
    let (heavy, heavy_port) = start(heavy_config);
    mine(&heavy, 1); // work 16

    let (by_work, _) = start(quiet_config());
    mine(&by_work, 3); // work 8
    let length_config = NodeConfig {
        chain_selection: ChainSelection::Length,
        ..quiet_config()
    };
    let (by_length, _) = start(length_config);
    mine(&by_length, 3);
    let by_length_before = by_length.chain_snapshot();

    assert!(by_work.connect_to_peer("127.0.0.1", heavy_port));
    assert!(by_length.connect_to_peer("127.0.0.1", heavy_port));

    assert!(wait_until(|| by_work.chain_snapshot() == heavy.chain_snapshot()));
    assert_eq!(by_work.difficulty(), 3);
    assert!(wait_until(|| {
        by_length.peer_state(&addr(heavy_port)) == Some(LinkState::Established)
    }));
    assert_eq!(by_length.chain_snapshot(), by_length_before);

    heavy.stop();
    by_work.stop();
    by_length.stop();
}

#[test]
fn test_blocks_gossip_across_three_nodes() {
    let (a, a_port) = start(quiet_config());
    let (b, b_port) = start(quiet_config());
    let (c, _) = start(quiet_config());

    assert!(b.connect_to_peer("127.0.0.1", a_port));
    assert!(c.connect_to_peer("127.0.0.1", b_port));
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 2));

    mine(&a, 3);
    assert!(wait_until(|| c.chain_snapshot() == a.chain_snapshot()));
    assert_eq!(b.chain_snapshot(), a.chain_snapshot());

    // Once in sync, a single new block travels as a block
    mine(&a, 1);
    assert!(wait_until(|| c.height() == 5));
    assert_eq!(c.latest_block(), a.latest_block());

    a.stop();
    b.stop();
    c.stop();
}

#[test]
fn test_malformed_frame_does_not_end_the_link() {
    let (node, port) = start(quiet_config());
    let mut client = raw_client(port);

    client
        .write_all(&encode_frame(b"definitely not a message").unwrap())
        .unwrap();
    send_raw(&mut client, &Message::SyncRequest);

    match receive_raw(&mut client) {
        Message::ChainResponse { blocks } => assert_eq!(blocks, node.chain_snapshot()),
        other => panic!("expected a chain, got {other:?}"),
    }
    node.stop();
}

#[test]
fn test_unlinked_block_gets_sync_request_back() {
    let (node, port) = start(quiet_config());
    let mut orphan = Block::new(1, 1, "no such parent", b"orphan".to_vec());
    orphan.mine_until_valid(1, || false).unwrap();
    let mut client = raw_client(port);

    send_raw(&mut client, &Message::Block { block: orphan });
    assert_eq!(receive_raw(&mut client), Message::SyncRequest);
    assert_eq!(node.height(), 1);
    node.stop();
}

#[test]
fn test_competing_blocks_at_same_height_accept_exactly_one() {
    let (node, port) = start(quiet_config());
    mine(&node, 1);
    let tail = node.latest_block().unwrap();
    let mut rival = Block::new(2, node.difficulty(), tail.get_hash(), b"rival".to_vec());
    rival.mine_until_valid(node.difficulty(), || false).unwrap();

    let mut client = raw_client(port);
    let sender = {
        let rival = rival.clone();
        thread::spawn(move || send_raw(&mut client, &Message::Block { block: rival }))
    };
    let ours = node.mine_block("ours").unwrap();
    sender.join().unwrap();

    let expected = ours.unwrap_or(rival.clone());
    assert!(wait_until(|| node.latest_block().as_ref() == Some(&expected)));
    // Give a late rival time to be rejected rather than appended
    thread::sleep(Duration::from_millis(200));

    let chain = node.chain_snapshot();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.iter().filter(|b| b.get_index() == 2).count(), 1);
    assert_eq!(chain[2], expected);
    assert!(Blockchain::validate_chain(&chain));
    node.stop();
}

#[test]
fn test_log_sink_sees_connection_and_block_events() {
    let events: Arc<Mutex<Vec<(String, Severity)>>> = Arc::new(Mutex::new(Vec::new()));
    let (a, a_port) = start(quiet_config());
    let sink_events = Arc::clone(&events);
    a.set_log_sink(move |message, severity| {
        sink_events
            .lock()
            .unwrap()
            .push((message.to_string(), severity));
    });

    let (b, _) = start(quiet_config());
    assert!(b.connect_to_peer("127.0.0.1", a_port));
    assert!(wait_until(|| a.peer_count() == 1));
    mine(&a, 1);

    let has = |needle: &str, severity: Severity| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|(message, s)| message.contains(needle) && *s == severity)
    };
    assert!(wait_until(|| has("connected", Severity::Success)));
    assert!(has("Mined block 1", Severity::Success));

    b.stop();
    assert!(wait_until(|| has("disconnected", Severity::Info)));
    a.stop();
}

#[test]
fn test_stop_closes_links_on_both_ends() {
    let (a, _) = start(quiet_config());
    let (b, b_port) = start(quiet_config());
    assert!(a.connect_to_peer("127.0.0.1", b_port));
    assert!(wait_until(|| b.peer_count() == 1));

    a.stop();
    assert!(!a.is_running());
    assert_eq!(a.peer_count(), 0);
    assert!(wait_until(|| b.peer_count() == 0));
    assert!(!a.connect_to_peer("127.0.0.1", b_port));
    b.stop();
}

#[test]
fn test_follower_tracks_mining_node() {
    let miner_config = NodeConfig {
        mining_enabled: true,
        ..quiet_config()
    };
    let (miner, miner_port) = start(miner_config);
    let (follower, _) = start(quiet_config());

    assert!(follower.connect_to_peer("127.0.0.1", miner_port));
    assert!(wait_until(|| follower.height() >= 3));

    miner.stop();
    follower.stop();
    let mined = miner.chain_snapshot();
    let followed = follower.chain_snapshot();
    assert!(mined.starts_with(&followed));
    assert!(Blockchain::validate_chain(&followed));
}
