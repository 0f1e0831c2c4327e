//! Connection pool tests - arbitration, data requests and deadlines.
//!
//! The pool is driven directly against an in-memory transport that records
//! every packet, so each test can inspect the exact bytes a peer would see.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ansible::commands::{CommandTable, ParamValue, SysCommand, SYS_DID};
use ansible::config::Config;
use ansible::error::{Error, Result, TransportError};
use ansible::protocol::{
    ClientPacket, ServerAsyncPacket, ServerPacket, ServerResponsePacket, StatusCode,
};
use ansible::server::{ConnectionPool, PoolConfig, PoolTimer, ServerCommand, ServerEvent};
use ansible::transport::{Transport, TransportEvent};
use ansible::types::{ConnectionState, PeerId, RemovalReason};

// ============================================================================
// Test Harness
// ============================================================================

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
    disconnected: Mutex<Vec<PeerId>>,
    failing: Mutex<Option<PeerId>>,
}

impl RecordingTransport {
    fn take(&self, peer: PeerId) -> Vec<ServerPacket> {
        let mut sent = self.sent.lock();
        let mut out = Vec::new();
        sent.retain(|(p, bytes)| {
            if *p == peer {
                out.push(ServerPacket::decode(bytes).unwrap());
                false
            } else {
                true
            }
        });
        out
    }

    fn responses(&self, peer: PeerId) -> Vec<ServerResponsePacket> {
        self.take(peer)
            .into_iter()
            .map(|packet| match packet {
                ServerPacket::Response(r) => r,
                ServerPacket::Async(a) => panic!("unexpected async packet {a:?}"),
            })
            .collect()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 41234)))
    }

    async fn send_to(&self, data: &[u8], peer: PeerId) -> Result<usize> {
        if *self.failing.lock() == Some(peer) {
            return Err(TransportError::SendFailed("peer unreachable".into()).into());
        }
        self.sent.lock().push((peer, data.to_vec()));
        Ok(data.len())
    }

    async fn disconnect(&self, peer: PeerId) -> Result<()> {
        self.disconnected.lock().push(peer);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "memory"
    }
}

struct Harness {
    pool: ConnectionPool,
    transport: Arc<RecordingTransport>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    commands: mpsc::UnboundedReceiver<ServerCommand>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    fn with_config(config: PoolConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let table = Arc::new(Config::default().command_table().unwrap());
        let (event_tx, events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            table,
            config,
            event_tx,
            command_tx,
        );
        Self {
            pool,
            transport,
            events,
            commands,
        }
    }

    async fn send(&mut self, peer: PeerId, packet: ClientPacket) {
        let bytes = packet.encode().unwrap();
        self.pool.process_message(&bytes, peer).await;
    }

    async fn sys(&mut self, peer: PeerId, cmd: SysCommand, seq: u8) {
        let packet = ClientPacket::new(SYS_DID, cmd.cid(), seq, Vec::new()).with_flags(true, true);
        self.send(peer, packet).await;
    }

    async fn handshake(&mut self, peer: PeerId) -> ServerResponsePacket {
        self.sys(peer, SysCommand::Conn, 1).await;
        self.sys(peer, SysCommand::ControlReq, 2).await;
        let mut responses = self.transport.responses(peer);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].mrsp, StatusCode::Ok.code());
        responses.remove(1)
    }

    fn drain_events(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Feed responder answers back into the pool, like the server loop does.
    async fn pump_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if let ServerCommand::Respond { id, data } = command {
                self.pool.respond(id, data).await;
            }
        }
    }
}

fn peer(port: u16) -> PeerId {
    PeerId::from(SocketAddr::from(([127, 0, 0, 1], port)))
}

fn table() -> CommandTable {
    Config::default().command_table().unwrap()
}

fn device_packet(function: &str, seq: u8, args: &[i64]) -> ClientPacket {
    let table = table();
    let command = table.descriptor_for_function(function).unwrap();
    ClientPacket::new(command.did, command.cid, seq, command.encode_args(args).unwrap())
        .with_flags(true, true)
}

fn closed_peers(events: &[ServerEvent]) -> Vec<(PeerId, RemovalReason)> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ConnectionClosed { peer, reason } => Some((*peer, reason.clone())),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Handshake and Arbitration
// ============================================================================

#[tokio::test]
async fn test_first_peer_becomes_active() {
    let mut h = Harness::new();
    let a = peer(5000);

    let control = h.handshake(a).await;
    assert_eq!(control.mrsp, StatusCode::Ok.code());
    assert_eq!(control.data, vec![0]);

    assert_eq!(h.pool.active_peer(), Some(a));
    assert_eq!(h.pool.connection(a).unwrap().state(), ConnectionState::Active);

    let transitions: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::StateChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (ConnectionState::PreConnect, ConnectionState::Connected),
            (ConnectionState::Connected, ConnectionState::Active),
        ]
    );
}

#[tokio::test]
async fn test_later_peers_are_queued_in_order() {
    let mut h = Harness::new();
    let (a, b, c) = (peer(5000), peer(5001), peer(5002));

    h.handshake(a).await;
    assert_eq!(h.handshake(b).await.data, vec![1]);
    assert_eq!(h.handshake(c).await.data, vec![1]);

    assert_eq!(h.pool.peers(), &[a, b, c]);
    assert_eq!(h.pool.connection(b).unwrap().state(), ConnectionState::Queued);
    assert_eq!(h.pool.connection(c).unwrap().state(), ConnectionState::Queued);
}

#[tokio::test]
async fn test_commands_before_conn_are_invalid_state() {
    let mut h = Harness::new();
    let a = peer(5000);

    h.sys(a, SysCommand::ControlReq, 7).await;
    let responses = h.transport.responses(a);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].seq, 7);
    assert_eq!(responses[0].status_code(), Some(StatusCode::InvalidState));
    assert_eq!(
        h.pool.connection(a).unwrap().state(),
        ConnectionState::PreConnect
    );
}

#[tokio::test]
async fn test_heartbeat_reports_active_state() {
    let mut h = Harness::new();
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;

    h.sys(a, SysCommand::Hbeat, 3).await;
    h.sys(b, SysCommand::Hbeat, 3).await;

    assert_eq!(h.transport.responses(a)[0].data, vec![0]);
    assert_eq!(h.transport.responses(b)[0].data, vec![1]);
}

#[tokio::test]
async fn test_version_query() {
    let mut h = Harness::with_config(PoolConfig {
        version: 0x0203,
        ..PoolConfig::default()
    });
    let a = peer(5000);
    h.handshake(a).await;

    h.sys(a, SysCommand::Vers, 3).await;
    let response = &h.transport.responses(a)[0];
    assert!(response.status_code().unwrap().is_ok());
    assert_eq!(response.data, vec![0x02, 0x03]);
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_close_promotes_next_peer() {
    let mut h = Harness::new();
    let (a, b, c) = (peer(5000), peer(5001), peer(5002));
    h.handshake(a).await;
    h.handshake(b).await;
    h.handshake(c).await;
    h.drain_events();

    h.sys(a, SysCommand::Close, 3).await;

    // CLOSE is not answered
    assert!(h.transport.responses(a).is_empty());
    assert_eq!(h.pool.active_peer(), Some(b));
    assert_eq!(h.pool.connection(b).unwrap().state(), ConnectionState::Active);
    assert_eq!(h.pool.connection(c).unwrap().state(), ConnectionState::Queued);
    assert_eq!(*h.transport.disconnected.lock(), vec![a]);

    let events = h.drain_events();
    assert_eq!(closed_peers(&events), vec![(a, RemovalReason::Closed)]);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::StateChanged { peer, from: ConnectionState::Queued, to: ConnectionState::Active }
            if *peer == b
    )));

    // The promoted peer learns about it on its next heartbeat
    h.sys(b, SysCommand::Hbeat, 4).await;
    assert_eq!(h.transport.responses(b)[0].data, vec![0]);
}

#[tokio::test]
async fn test_removing_queued_peer_keeps_active() {
    let mut h = Harness::new();
    let (a, b, c) = (peer(5000), peer(5001), peer(5002));
    h.handshake(a).await;
    h.handshake(b).await;
    h.handshake(c).await;

    h.sys(b, SysCommand::Close, 3).await;

    assert_eq!(h.pool.active_peer(), Some(a));
    assert_eq!(h.pool.peers(), &[a, c]);
    assert_eq!(h.pool.connection(c).unwrap().state(), ConnectionState::Queued);
}

#[tokio::test]
async fn test_at_most_one_active_peer() {
    let mut h = Harness::new();
    let peers: Vec<PeerId> = (0..5).map(|i| peer(5000 + i)).collect();
    for p in &peers {
        h.handshake(*p).await;
    }

    for leaving in &peers[..4] {
        h.sys(*leaving, SysCommand::Close, 9).await;
        let active = h
            .pool
            .peers()
            .iter()
            .filter(|p| h.pool.connection(**p).unwrap().state() == ConnectionState::Active)
            .count();
        assert_eq!(active, 1);
    }
    assert_eq!(h.pool.active_peer(), Some(peers[4]));
}

#[tokio::test]
async fn test_transport_closed_removes_peer() {
    let mut h = Harness::new();
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;
    h.drain_events();

    h.pool
        .handle_transport_event(TransportEvent::Closed { peer: a })
        .await;

    assert_eq!(h.pool.active_peer(), Some(b));
    assert_eq!(
        closed_peers(&h.drain_events()),
        vec![(a, RemovalReason::TransportClosed)]
    );
}

#[tokio::test]
async fn test_send_failure_removes_peer() {
    let mut h = Harness::new();
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;
    h.drain_events();

    *h.transport.failing.lock() = Some(a);
    h.sys(a, SysCommand::Hbeat, 3).await;

    assert_eq!(h.pool.active_peer(), Some(b));
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::Error { peer: Some(p), .. } if *p == a)));
    assert!(matches!(
        closed_peers(&events).as_slice(),
        [(p, RemovalReason::TransportError(_))] if *p == a
    ));
}

// ============================================================================
// Device Commands
// ============================================================================

#[tokio::test]
async fn test_device_command_from_active_is_acknowledged() {
    let mut h = Harness::new();
    let a = peer(5000);
    h.handshake(a).await;
    h.drain_events();

    h.send(a, device_packet("set_motor", 5, &[-200])).await;

    let responses = h.transport.responses(a);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].seq, 5);
    assert!(responses[0].data.is_empty());

    match h.drain_events().as_slice() {
        [ServerEvent::CommandReceived { peer, command, params }] => {
            assert_eq!(*peer, a);
            assert_eq!(command.full_name(), "ROBOT:SET_MOTOR");
            assert_eq!(params.get("port"), Some(&ParamValue::I16(-200)));
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn test_device_command_from_queued_peer_is_ignored() {
    let mut h = Harness::new();
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;
    h.drain_events();

    h.send(b, device_packet("set_motor", 5, &[10])).await;

    assert!(h.transport.responses(b).is_empty());
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn test_unknown_command_is_invalid_command() {
    let mut h = Harness::new();
    let a = peer(5000);
    h.handshake(a).await;

    h.send(a, ClientPacket::new(0x42, 0x01, 5, Vec::new())).await;

    let responses = h.transport.responses(a);
    assert_eq!(responses[0].status_code(), Some(StatusCode::InvalidCommand));
}

#[tokio::test]
async fn test_short_payload_is_invalid_command() {
    let mut h = Harness::new();
    let a = peer(5000);
    h.handshake(a).await;

    let mut packet = device_packet("set_motor", 5, &[1]);
    packet.data.truncate(1);
    h.send(a, packet).await;

    let responses = h.transport.responses(a);
    assert_eq!(responses[0].status_code(), Some(StatusCode::InvalidCommand));
}

#[tokio::test]
async fn test_malformed_packets_are_dropped() {
    let mut h = Harness::new();
    let a = peer(5000);

    // Too short, bad header, bad checksum
    h.pool.process_message(&[0xFF, 0xFC], a).await;
    h.pool
        .process_message(&[0x00, 0xFC, 0x00, 0x01, 0x01, 0x01, 0xFC], a)
        .await;
    h.pool
        .process_message(&[0xFF, 0xFC, 0x00, 0x01, 0x01, 0x01, 0x00], a)
        .await;

    assert_eq!(h.transport.sent_count(), 0);
    assert!(h.pool.is_empty());
}

// ============================================================================
// Data Required
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_data_required_respond() {
    let mut h = Harness::new();
    let a = peer(5000);
    h.handshake(a).await;
    h.drain_events();

    h.send(a, device_packet("get_digital", 9, &[3])).await;
    assert!(h.transport.responses(a).is_empty());
    assert_eq!(h.pool.pending_requests(), 1);

    let request = match h.drain_events().pop() {
        Some(ServerEvent::DataRequired(request)) => request,
        other => panic!("expected data request, got {other:?}"),
    };
    assert_eq!(request.peer, a);
    assert_eq!(request.params.get("port"), Some(&ParamValue::U8(3)));

    request.respond(vec![1]);
    h.pump_commands().await;

    let responses = h.transport.responses(a);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].seq, 9);
    assert_eq!(responses[0].status_code(), Some(StatusCode::Ok));
    assert_eq!(responses[0].data, vec![1]);
    assert_eq!(h.pool.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_data_required_timeout_answers_once() {
    let mut h = Harness::new();
    let a = peer(5000);
    h.handshake(a).await;
    h.drain_events();

    h.send(a, device_packet("get_analog", 11, &[0])).await;
    let request = match h.drain_events().pop() {
        Some(ServerEvent::DataRequired(request)) => request,
        other => panic!("expected data request, got {other:?}"),
    };

    let started = tokio::time::Instant::now();
    let timer = h.pool.next_expired().await;
    assert!(matches!(timer, PoolTimer::DataRequired(_)));
    assert!(started.elapsed() >= Duration::from_millis(1500));
    h.pool.handle_timer(timer).await;

    let responses = h.transport.responses(a);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].seq, 11);
    assert_eq!(responses[0].status_code(), Some(StatusCode::RequestTimedOut));

    // A late answer is ignored
    request.respond(vec![0x12, 0x34]);
    h.pump_commands().await;
    assert!(h.transport.responses(a).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_answer_falls_back_to_timeout() {
    let mut h = Harness::new();
    let a = peer(5000);
    h.handshake(a).await;
    h.drain_events();

    h.send(a, device_packet("get_digital", 9, &[3])).await;
    let request = match h.drain_events().pop() {
        Some(ServerEvent::DataRequired(request)) => request,
        other => panic!("expected data request, got {other:?}"),
    };

    request.respond(vec![0; 300]);
    h.pump_commands().await;

    assert!(h.transport.responses(a).is_empty());
    assert_eq!(h.pool.pending_requests(), 1);
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        ServerEvent::Error {
            error: Error::Protocol(_),
            ..
        }
    )));

    let timer = h.pool.next_expired().await;
    assert!(matches!(timer, PoolTimer::DataRequired(_)));
    h.pool.handle_timer(timer).await;

    let responses = h.transport.responses(a);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].seq, 9);
    assert_eq!(responses[0].status_code(), Some(StatusCode::RequestTimedOut));
    assert_eq!(h.pool.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_data_request_cancelled_when_peer_leaves() {
    let mut h = Harness::with_config(PoolConfig {
        heartbeat_timeout: Duration::ZERO,
        ..PoolConfig::default()
    });
    let a = peer(5000);
    h.handshake(a).await;

    h.send(a, device_packet("get_digital", 9, &[3])).await;
    assert_eq!(h.pool.pending_requests(), 1);

    h.sys(a, SysCommand::Close, 10).await;
    assert_eq!(h.pool.pending_requests(), 0);

    // Nothing left to expire
    let expired = tokio::time::timeout(Duration::from_secs(10), h.pool.next_expired()).await;
    assert!(expired.is_err());
}

// ============================================================================
// Heartbeat Deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let mut h = Harness::with_config(PoolConfig {
        heartbeat_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    });
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;
    h.drain_events();

    // b keeps talking, a stays silent
    for seq in 10..14 {
        tokio::time::advance(Duration::from_secs(2)).await;
        h.sys(b, SysCommand::Hbeat, seq).await;
        while let Ok(timer) = tokio::time::timeout(Duration::ZERO, h.pool.next_expired()).await {
            h.pool.handle_timer(timer).await;
        }
    }

    assert_eq!(h.pool.peers(), &[b]);
    assert_eq!(h.pool.active_peer(), Some(b));
    assert_eq!(
        closed_peers(&h.drain_events()),
        vec![(a, RemovalReason::TimedOut)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_queued_peer_is_not_kept_alive_by_rejected_requests() {
    let mut h = Harness::with_config(PoolConfig {
        heartbeat_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    });
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;
    h.drain_events();

    for cmd in [SysCommand::Vers, SysCommand::ControlReq] {
        h.sys(b, cmd, 9).await;
        let responses = h.transport.responses(b);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code(), Some(StatusCode::InvalidState));
        assert!(responses[0].data.is_empty());
    }

    // a heartbeats, b only asks for the version
    for seq in 10..16 {
        tokio::time::advance(Duration::from_secs(2)).await;
        h.sys(a, SysCommand::Hbeat, seq).await;
        if h.pool.connection(b).is_some() {
            h.sys(b, SysCommand::Vers, seq).await;
        }
        while let Ok(timer) = tokio::time::timeout(Duration::ZERO, h.pool.next_expired()).await {
            h.pool.handle_timer(timer).await;
        }
    }

    assert_eq!(h.pool.peers(), &[a]);
    assert_eq!(
        closed_peers(&h.drain_events()),
        vec![(b, RemovalReason::TimedOut)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_zero_heartbeat_timeout_disables_check() {
    let mut h = Harness::with_config(PoolConfig {
        heartbeat_timeout: Duration::ZERO,
        ..PoolConfig::default()
    });
    let a = peer(5000);
    h.handshake(a).await;

    let expired = tokio::time::timeout(Duration::from_secs(60), h.pool.next_expired()).await;
    assert!(expired.is_err());
    assert_eq!(h.pool.active_peer(), Some(a));
}

// ============================================================================
// Async Messages
// ============================================================================

#[tokio::test]
async fn test_async_message_goes_to_active_peer() {
    let mut h = Harness::new();
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;

    h.pool.send_async_message(1, vec![0xAA], false).await.unwrap();

    assert_eq!(
        h.transport.take(a),
        vec![ServerPacket::Async(ServerAsyncPacket::new(1, vec![0xAA]))]
    );
    assert!(h.transport.take(b).is_empty());
}

#[tokio::test]
async fn test_async_message_broadcast() {
    let mut h = Harness::new();
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;

    h.pool.send_async_message(2, vec![1, 2, 3], true).await.unwrap();

    for p in [a, b] {
        assert_eq!(
            h.transport.take(p),
            vec![ServerPacket::Async(ServerAsyncPacket::new(2, vec![1, 2, 3]))]
        );
    }
}

#[tokio::test]
async fn test_async_message_without_peers() {
    let mut h = Harness::new();
    h.pool.send_async_message(1, vec![0], false).await.unwrap();
    assert_eq!(h.transport.sent_count(), 0);
}

#[tokio::test]
async fn test_async_message_too_large() {
    let mut h = Harness::new();
    let a = peer(5000);
    h.handshake(a).await;

    let result = h.pool.send_async_message(1, vec![0; 70_000], false).await;
    assert!(matches!(result, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn test_close_all_sends_no_promotions() {
    let mut h = Harness::new();
    let (a, b) = (peer(5000), peer(5001));
    h.handshake(a).await;
    h.handshake(b).await;
    h.drain_events();

    h.pool.close_all().await;

    assert!(h.pool.is_empty());
    let events = h.drain_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, ServerEvent::StateChanged { .. })));
    assert_eq!(
        closed_peers(&events),
        vec![(b, RemovalReason::Shutdown), (a, RemovalReason::Shutdown)]
    );
}
