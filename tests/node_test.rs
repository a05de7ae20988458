//! End-to-end node scenarios over real loopback sockets.
//!
//! Covers the discovery-to-Connected happy path between two in-process
//! nodes, the frame/version/self gates, and a scripted wire-level peer that
//! walks the full five-step handshake including the encrypted Ready.

use kapua::config::Config;
use kapua::core::Core;
use kapua::crypto::{self, KeyPair, SessionKey};
use kapua::net::{Packet, PacketType, PeerState, HEADER_LEN};
use kapua::types::NodeId;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

/// Small RSA keys keep the tests quick; the protocol paths are identical.
const TEST_KEY_BITS: usize = 1024;

fn spawn_node(seeds: Vec<SocketAddrV4>) -> Core {
    let mut config = Config::default();
    config.bind_address = Ipv4Addr::LOCALHOST;
    config.port = 0; // ephemeral, so tests never collide
    config.local_discovery_enable = true;
    config.local_discovery_interval_ms = 100;
    config.seeds = seeds;

    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let core = Core::new(config, keys).unwrap();
    assert!(core.start());
    core
}

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => panic!("node bound to IPv6"),
    }
}

fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn two_nodes_reach_connected() {
    let a = spawn_node(vec![]);
    let a_addr = v4(a.local_addr().unwrap());
    let b = spawn_node(vec![a_addr]);

    let connected = wait_for(Duration::from_secs(5), || {
        let a_done = a
            .peer(b.my_id())
            .map(|p| p.state == PeerState::Connected)
            .unwrap_or(false);
        let b_done = b
            .peer(a.my_id())
            .map(|p| p.state == PeerState::Connected)
            .unwrap_or(false);
        a_done && b_done
    });
    assert!(connected, "nodes never reached Connected");

    // Connected implies both directions keyed, keys cross-matched and
    // distinct per direction.
    let a_view = a.peer(b.my_id()).unwrap();
    let b_view = b.peer(a.my_id()).unwrap();

    let a_tx = a_view.session_key_tx.expect("A missing tx key");
    let a_rx = a_view.session_key_rx.expect("A missing rx key");
    let b_tx = b_view.session_key_tx.expect("B missing tx key");
    let b_rx = b_view.session_key_rx.expect("B missing rx key");

    assert_eq!(a_tx, b_rx);
    assert_eq!(b_tx, a_rx);
    assert_ne!(a_tx, a_rx);
    assert_ne!(a_tx, [0u8; 32]);
    assert_ne!(a_rx, [0u8; 32]);

    a.stop();
    b.stop();
}

#[test]
fn zeroed_datagram_is_ignored() {
    let a = spawn_node(vec![]);
    let a_addr = a.local_addr().unwrap();

    let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.send_to(&[0u8; HEADER_LEN], a_addr).unwrap();

    // Give the loop time to (not) react.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a.peer_count(), 0);

    a.stop();
}

#[test]
fn version_skew_is_dropped() {
    let a = spawn_node(vec![]);
    let a_addr = a.local_addr().unwrap();

    let stranger: NodeId = 0xDEAD;
    let pkt = Packet::new(PacketType::Discovery, stranger);
    let mut buf = pkt.serialize().unwrap();
    buf[5] = buf[5].wrapping_add(1); // bump version.major

    let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.send_to(&buf, a_addr).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert!(a.peer(stranger).is_none());
    assert_eq!(a.peer_count(), 0);

    a.stop();
}

#[test]
fn own_discovery_echo_is_dropped() {
    let a = spawn_node(vec![]);
    let a_addr = a.local_addr().unwrap();

    // Echo a Discovery claiming the node's own id back at it.
    let echo = Packet::new(PacketType::Discovery, a.my_id());
    let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.send_to(&echo.serialize().unwrap(), a_addr).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert!(a.peer(a.my_id()).is_none());
    assert_eq!(a.peer_count(), 0);

    a.stop();
}

/// Receive one packet on the probe socket, decrypting with `rx_key` when the
/// plaintext parse fails.
fn recv_packet(socket: &UdpSocket, rx_key: Option<&SessionKey>) -> Packet {
    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).expect("timed out waiting for node");
    match Packet::deserialize(&buf[..len]) {
        Ok(pkt) => pkt,
        Err(_) => {
            let key = rx_key.expect("got encrypted traffic before key exchange");
            let plain = crypto::open(key, &buf[..len]).expect("cannot decrypt datagram");
            Packet::deserialize(&plain).expect("decrypted datagram is not a packet")
        }
    }
}

#[test]
fn scripted_peer_walks_full_handshake() {
    let a = spawn_node(vec![]);
    let a_id = a.my_id();
    let a_addr = a.local_addr().unwrap();

    let fake_id: NodeId = 0xF00D;
    let fake_keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // Step 1: ask for the node's public key. This also registers us, so the
    // node queues its own request for ours.
    let req = Packet::unicast(PacketType::PublicKeyRequest, fake_id, a_id);
    socket.send_to(&req.serialize().unwrap(), a_addr).unwrap();

    // Expect the reply and the node's own request, in whichever order.
    let mut node_public = None;
    let mut node_request = None;
    while node_public.is_none() || node_request.is_none() {
        let pkt = recv_packet(&socket, None);
        match pkt.packet_type {
            PacketType::PublicKeyReply => {
                assert_eq!(pkt.from_id, a_id);
                node_public = Some(pkt.read_public_key().unwrap());
            }
            PacketType::PublicKeyRequest => node_request = Some(pkt),
            PacketType::Discovery => {}
            other => panic!("unexpected {:?} during key exchange", other),
        }
    }
    let node_public = node_public.unwrap();

    // Step 2: answer the node's request with our key; the node wraps a fresh
    // session key for us in response.
    let request_id = node_request.unwrap().packet_id;
    let mut reply = Packet::reply(PacketType::PublicKeyReply, fake_id, a_id, request_id);
    reply.write_public_key(&fake_keys).unwrap();
    socket.send_to(&reply.serialize().unwrap(), a_addr).unwrap();

    let mut node_tx: Option<SessionKey> = None;
    while node_tx.is_none() {
        let pkt = recv_packet(&socket, None);
        match pkt.packet_type {
            PacketType::EncryptionContext => {
                node_tx = Some(crypto::decrypt_session_key(&pkt.payload, &fake_keys).unwrap());
            }
            PacketType::Discovery | PacketType::PublicKeyRequest => {}
            other => panic!("unexpected {:?} waiting for context", other),
        }
    }
    let node_tx = node_tx.unwrap();

    // Step 3: hand the node our send key. From here the node is past the
    // encryption threshold, so its Ready must arrive encrypted under the key
    // it just wrapped for us.
    let fake_tx = crypto::generate_session_key();
    let mut ctx = Packet::unicast(PacketType::EncryptionContext, fake_id, a_id);
    ctx.payload = crypto::encrypt_session_key(&fake_tx, &node_public).unwrap();
    socket.send_to(&ctx.serialize().unwrap(), a_addr).unwrap();

    loop {
        let pkt = recv_packet(&socket, Some(&node_tx));
        match pkt.packet_type {
            PacketType::Ready => {
                assert_eq!(pkt.from_id, a_id);
                break;
            }
            PacketType::Discovery | PacketType::PublicKeyRequest => {}
            other => panic!("unexpected {:?} waiting for ready", other),
        }
    }

    // Step 4: prove our receive direction back. That completes the node's
    // state machine for us.
    let ready = Packet::unicast(PacketType::Ready, fake_id, a_id);
    let sealed = crypto::seal(&fake_tx, &ready.serialize().unwrap()).unwrap();
    socket.send_to(&sealed, a_addr).unwrap();

    let connected = wait_for(Duration::from_secs(2), || {
        a.peer(fake_id)
            .map(|p| p.state == PeerState::Connected)
            .unwrap_or(false)
    });
    assert!(connected, "node never marked the scripted peer Connected");

    let view = a.peer(fake_id).unwrap();
    assert_eq!(view.session_key_tx, Some(node_tx));
    assert_eq!(view.session_key_rx, Some(fake_tx));

    a.stop();
}

#[test]
fn silent_peer_is_evicted() {
    let mut config = Config::default();
    config.bind_address = Ipv4Addr::LOCALHOST;
    config.port = 0;
    config.local_discovery_enable = false;
    config.peer_expiry_ms = 400;

    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let a = Core::new(config, keys).unwrap();
    assert!(a.start());
    let a_addr = a.local_addr().unwrap();

    let ghost: NodeId = 0x9057;
    let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let hello = Packet::new(PacketType::Discovery, ghost);
    probe.send_to(&hello.serialize().unwrap(), a_addr).unwrap();

    assert!(
        wait_for(Duration::from_secs(1), || a.peer(ghost).is_some()),
        "ghost peer never registered"
    );
    assert!(
        wait_for(Duration::from_secs(3), || a.peer(ghost).is_none()),
        "silent peer was never evicted"
    );

    a.stop();
}
