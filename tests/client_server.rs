//! End-to-end tests - a real server and clients over loopback UDP and TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ansible::client::{AnsibleClient, ClientEvent, ClientOptions};
use ansible::commands::{CommandTable, ParamValue, SysCommand, SYS_DID};
use ansible::config::Config;
use ansible::error::{Error, Result};
use ansible::protocol::{ClientPacket, ServerResponsePacket, StatusCode};
use ansible::server::{AnsibleServer, ServerEvent, ServerHandle};
use ansible::transport::{self, TransportConfig, TransportProtocol};
use ansible::types::{ClientState, ConnectionState, DisconnectReason, PeerId, RemovalReason};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Harness
// ============================================================================

struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    /// Events other than data requests, which are answered automatically.
    events: mpsc::UnboundedReceiver<ServerEvent>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    /// Start a server that answers every data request with `0x01` bytes
    /// filling the return type, or leaves it unanswered when `answer` is false.
    async fn start(protocol: TransportProtocol, answer: bool) -> Self {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.server.protocol = protocol;

        let (server, mut raw_events) = AnsibleServer::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = raw_events.recv().await {
                match event {
                    ServerEvent::DataRequired(request) => {
                        if answer {
                            let width = request
                                .command
                                .return_type
                                .and_then(|ty| ty.width())
                                .unwrap_or(1);
                            request.respond(vec![0x01; width]);
                        }
                    }
                    other => {
                        let _ = tx.send(other);
                    }
                }
            }
        });

        Self {
            addr,
            handle,
            events,
            task,
        }
    }

    fn client_config(&self, protocol: TransportProtocol) -> Config {
        let mut config = Config::default();
        config.client.server_addr = self.addr;
        config.client.protocol = protocol;
        config
    }

    async fn next_event<F>(&mut self, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("server stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for server event")
    }

    async fn stop(self) {
        self.handle.shutdown().unwrap();
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }
}

async fn next_client_event<F>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut pred: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("client event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

// ============================================================================
// UDP
// ============================================================================

#[tokio::test]
async fn test_udp_connect_and_command() {
    let mut server = TestServer::start(TransportProtocol::Udp, true).await;
    let (client, _events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Udp))
            .await
            .unwrap();

    assert_eq!(client.state(), ClientState::Active);
    assert!(client.is_connected());

    let result = client.request("set_motor", &[-200]).await.unwrap();
    assert_eq!(result, None);

    match server
        .next_event(|e| matches!(e, ServerEvent::CommandReceived { .. }))
        .await
    {
        ServerEvent::CommandReceived { command, params, .. } => {
            assert_eq!(command.function_name.as_deref(), Some("set_motor"));
            assert_eq!(params.get("port"), Some(&ParamValue::I16(-200)));
        }
        _ => unreachable!(),
    }

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_udp_data_required_round_trip() {
    let server = TestServer::start(TransportProtocol::Udp, true).await;
    let (client, _events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Udp))
            .await
            .unwrap();

    let value = client.request("get_digital", &[3]).await.unwrap();
    assert_eq!(value, Some(ParamValue::U8(1)));

    let value = client.request_command("ROBOT:GET_DIGITAL", &[4]).await.unwrap();
    assert_eq!(value, Some(ParamValue::U8(1)));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_udp_unanswered_data_request_times_out() {
    let server = TestServer::start(TransportProtocol::Udp, false).await;
    let (client, _events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Udp))
            .await
            .unwrap();

    let started = std::time::Instant::now();
    let err = client.request("get_digital", &[3]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::RequestFailed { status } if status == StatusCode::RequestTimedOut.code()
    ));
    assert!(started.elapsed() >= Duration::from_millis(1400));

    // Still usable afterwards
    assert!(client.request("set_motor", &[1]).await.is_ok());

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_udp_version() {
    let server = TestServer::start(TransportProtocol::Udp, true).await;
    let (client, _events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Udp))
            .await
            .unwrap();

    assert_eq!(client.get_version().await.unwrap(), (1, 0));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_udp_failover_promotes_queued_client() {
    let mut server = TestServer::start(TransportProtocol::Udp, true).await;
    let config = server.client_config(TransportProtocol::Udp);

    let (first, _first_events) = AnsibleClient::connect(&config).await.unwrap();
    let (second, mut second_events) = AnsibleClient::connect(&config).await.unwrap();

    assert_eq!(first.state(), ClientState::Active);
    assert_eq!(second.state(), ClientState::Queued);

    // Queued clients may not drive devices
    let err = second.request("set_motor", &[5]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidClientState(_)));

    first.close().await.unwrap();
    server
        .next_event(|e| {
            matches!(
                e,
                ServerEvent::ConnectionClosed {
                    reason: RemovalReason::Closed,
                    ..
                }
            )
        })
        .await;

    // The next heartbeat reports the promotion
    next_client_event(&mut second_events, |e| {
        matches!(
            e,
            ClientEvent::StateChanged {
                old: ClientState::Queued,
                new: ClientState::Active
            }
        )
    })
    .await;
    assert!(second.request("set_motor", &[5]).await.is_ok());

    second.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_udp_async_event() {
    let server = TestServer::start(TransportProtocol::Udp, true).await;
    let (client, mut events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Udp))
            .await
            .unwrap();

    server
        .handle
        .send_async_event("DIGITAL_CHANGED", vec![0x03, 0x01], false)
        .unwrap();

    match next_client_event(&mut events, |e| matches!(e, ClientEvent::AsyncEvent { .. })).await {
        ClientEvent::AsyncEvent { id_code, name, data } => {
            assert_eq!(id_code, 1);
            assert_eq!(name, "DIGITAL_CHANGED");
            assert_eq!(data, vec![0x03, 0x01]);
        }
        _ => unreachable!(),
    }

    assert!(matches!(
        server.handle.send_async_event("NO_SUCH_EVENT", vec![], false),
        Err(Error::UnknownCommand(_))
    ));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_close_reports_socket_closed() {
    let server = TestServer::start(TransportProtocol::Udp, true).await;
    let (client, mut events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Udp))
            .await
            .unwrap();

    client.close().await.unwrap();

    match next_client_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
        ClientEvent::Disconnected { code, reason } => {
            assert_eq!(code, 0);
            assert_eq!(reason, DisconnectReason::SocketClosed);
        }
        _ => unreachable!(),
    }
    assert_eq!(client.state(), ClientState::NotConnected);
    assert!(matches!(
        client.request("set_motor", &[1]).await,
        Err(Error::NotConnected)
    ));

    server.stop().await;
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_tcp_connect_command_and_close() {
    let mut server = TestServer::start(TransportProtocol::Tcp, true).await;
    let (client, _events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Tcp))
            .await
            .unwrap();

    assert_eq!(client.state(), ClientState::Active);
    assert_eq!(
        client.request("get_analog", &[2]).await.unwrap(),
        Some(ParamValue::U16(0x0101))
    );
    assert_eq!(client.request("set_motor", &[300]).await.unwrap(), None);

    client.close().await.unwrap();
    server
        .next_event(|e| matches!(e, ServerEvent::ConnectionClosed { .. }))
        .await;

    server.stop().await;
}

#[tokio::test]
async fn test_tcp_server_shutdown_disconnects_client() {
    let server = TestServer::start(TransportProtocol::Tcp, true).await;
    let (client, mut events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Tcp))
            .await
            .unwrap();

    server.stop().await;

    match next_client_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
        ClientEvent::Disconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::SocketClosed);
        }
        _ => unreachable!(),
    }
    assert!(!client.is_connected());
}

fn sys_packet(cmd: SysCommand, seq: u8) -> Vec<u8> {
    ClientPacket::new(SYS_DID, cmd.cid(), seq, Vec::new())
        .encode()
        .unwrap()
}

#[tokio::test]
async fn test_tcp_peer_that_stops_reading_is_dropped() {
    let mut server = TestServer::start(TransportProtocol::Tcp, true).await;

    // Takes control, then never reads another byte
    let mut stalled = TcpStream::connect(server.addr).await.unwrap();
    let stalled_peer = PeerId::new(stalled.local_addr().unwrap());
    stalled.write_all(&sys_packet(SysCommand::Conn, 1)).await.unwrap();
    stalled
        .write_all(&sys_packet(SysCommand::ControlReq, 2))
        .await
        .unwrap();
    server
        .next_event(|e| {
            matches!(
                e,
                ServerEvent::StateChanged {
                    to: ConnectionState::Active,
                    ..
                }
            )
        })
        .await;

    for _ in 0..400 {
        server
            .handle
            .send_async_message(0x10, vec![0xAB; 60_000], true)
            .unwrap();
    }

    let closed = server
        .next_event(|e| {
            matches!(e, ServerEvent::ConnectionClosed { peer, .. } if *peer == stalled_peer)
        })
        .await;
    match closed {
        ServerEvent::ConnectionClosed { reason, .. } => {
            assert!(matches!(reason, RemovalReason::TransportError(_)));
        }
        _ => unreachable!(),
    }

    // The server loop keeps serving everyone else
    let (client, _events) = timeout(
        Duration::from_secs(3),
        AnsibleClient::connect(&server.client_config(TransportProtocol::Tcp)),
    )
    .await
    .expect("server loop stalled behind a peer that stopped reading")
    .unwrap();
    assert_eq!(client.state(), ClientState::Active);
    assert_eq!(client.request("set_motor", &[10]).await.unwrap(), None);

    drop(stalled);
    server.stop().await;
}

#[tokio::test]
async fn test_tcp_peer_closing_mid_frame() {
    let mut server = TestServer::start(TransportProtocol::Tcp, true).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let peer = PeerId::new(stream.local_addr().unwrap());
    stream.write_all(&sys_packet(SysCommand::Conn, 1)).await.unwrap();
    let partial = sys_packet(SysCommand::ControlReq, 2);
    stream.write_all(&partial[..4]).await.unwrap();
    stream.flush().await.unwrap();
    drop(stream);

    match server
        .next_event(|e| matches!(e, ServerEvent::ConnectionClosed { .. }))
        .await
    {
        ServerEvent::ConnectionClosed { peer: closed, reason } => {
            assert_eq!(closed, peer);
            assert_eq!(reason, RemovalReason::TransportClosed);
        }
        _ => unreachable!(),
    }

    // The half packet never reached the state machine, so nobody holds control
    let (client, _events) =
        AnsibleClient::connect(&server.client_config(TransportProtocol::Tcp))
            .await
            .unwrap();
    assert_eq!(client.state(), ClientState::Active);

    client.close().await.unwrap();
    server.stop().await;
}

// ============================================================================
// Heartbeats
// ============================================================================

/// A gateway that completes the handshake and then goes silent.
async fn spawn_silent_gateway() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        let mut answered = 0;
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let Ok(packet) = ClientPacket::decode(&buf[..n]) else {
                continue;
            };
            if answered >= 2 {
                continue;
            }
            let data = if packet.cid == SysCommand::ControlReq.cid() {
                vec![0]
            } else {
                Vec::new()
            };
            let response = ServerResponsePacket::ok(packet.seq, data).encode().unwrap();
            socket.send_to(&response, from).await.unwrap();
            answered += 1;
        }
    });

    addr
}

#[tokio::test]
async fn test_missed_heartbeats_disconnect() {
    let gateway = spawn_silent_gateway().await;
    let (transport, inbound) =
        transport::connect(TransportProtocol::Udp, gateway, &TransportConfig::default())
            .await
            .unwrap();

    let options = ClientOptions {
        heartbeat_interval: Duration::from_millis(50),
        request_timeout: Duration::from_millis(100),
        missed_heartbeats: 3,
    };
    let (client, mut events) = AnsibleClient::connect_with(
        transport,
        inbound,
        PeerId::new(gateway),
        Arc::new(CommandTable::new()),
        options,
    )
    .await
    .unwrap();
    assert_eq!(client.state(), ClientState::Active);

    match next_client_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
        ClientEvent::Disconnected { code, reason } => {
            assert_eq!(code, 1);
            assert_eq!(reason, DisconnectReason::MissedHeartbeat);
        }
        _ => unreachable!(),
    }

    next_client_event(&mut events, |e| {
        matches!(
            e,
            ClientEvent::StateChanged {
                new: ClientState::NotConnected,
                ..
            }
        )
    })
    .await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_handshake_fails_without_server() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent = socket.local_addr().unwrap();

    let (transport, inbound) =
        transport::connect(TransportProtocol::Udp, silent, &TransportConfig::default())
            .await
            .unwrap();
    let options = ClientOptions {
        request_timeout: Duration::from_millis(100),
        ..ClientOptions::default()
    };

    let result = AnsibleClient::connect_with(
        transport,
        inbound,
        PeerId::new(silent),
        Arc::new(CommandTable::new()),
        options,
    )
    .await;
    assert!(matches!(result, Err(Error::RequestTimedOut { .. })));
    drop(socket);
}
