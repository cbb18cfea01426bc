//! End-to-end session tests over loopback TCP.
//!
//! The serial side of each session is an in-memory duplex stream, so the
//! tests can type into one end of the virtual wire and read the other,
//! exactly like a program attached to the real port would.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use soe::session::{run_session, Role, SessionConfig, SessionSummary};
use soe::status::NullStatus;
use soe::{BoxLink, LineFormat, SerialConfig};

fn serial_cfg(name: &str) -> SerialConfig {
    SerialConfig::new(name, 9600, LineFormat::default()).unwrap()
}

fn session_cfg(role: Role, port_name: &str, password: Option<&str>) -> SessionConfig {
    SessionConfig {
        role,
        serial: serial_cfg(port_name),
        password: password.map(str::to_string),
        keepalive: 30,
    }
}

/// Spawn a session over `link` with a fresh duplex "serial port"; returns
/// the outside end of the port and the summary handle.
fn spawn_session(
    cfg: SessionConfig,
    link: BoxLink,
    shutdown: CancellationToken,
) -> (DuplexStream, tokio::task::JoinHandle<anyhow::Result<SessionSummary>>) {
    let (inside, outside) = tokio::io::duplex(16 * 1024);
    let handle = tokio::spawn(run_session(
        cfg,
        link,
        Box::new(inside) as BoxLink,
        shutdown,
        Arc::new(NullStatus),
    ));
    (outside, handle)
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    (accepted, connect.await.unwrap())
}

async fn read_until(
    stream: &mut (impl tokio::io::AsyncRead + Unpin),
    expected: &[u8],
) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !collected
        .windows(expected.len().max(1))
        .any(|w| w == expected)
    {
        let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
            .await
            .expect("timed out waiting for bytes")
            .expect("stream failed");
        assert!(n > 0, "stream closed while waiting for {expected:?}");
        collected.extend_from_slice(&buf[..n]);
    }
    collected
}

#[tokio::test]
async fn test_bridge_to_server_byte_transparency() {
    let (server_sock, bridge_sock) = tcp_pair().await;
    let server_stop = CancellationToken::new();
    let bridge_stop = CancellationToken::new();

    let (mut server_port, server_task) = spawn_session(
        session_cfg(Role::Server, "SRV-A", None),
        Box::new(server_sock),
        server_stop.clone(),
    );
    let (mut bridge_port, bridge_task) = spawn_session(
        session_cfg(Role::Bridge, "BR-A", None),
        Box::new(bridge_sock),
        bridge_stop.clone(),
    );

    // Let the handshake settle so the bridge's data plane is open.
    tokio::time::sleep(Duration::from_millis(500)).await;

    bridge_port.write_all(b"hello\n").await.unwrap();
    let seen = read_until(&mut server_port, b"hello\n").await;
    assert!(seen.ends_with(b"hello\n"), "got {seen:?}");
    // No control frames may leak onto the serial side.
    assert!(!seen.windows(3).any(|w| w == b"__#"), "control bytes leaked: {seen:?}");

    // And the other direction, including non-UTF8 payload.
    let binary = [0x00u8, 0xE0, 0x41, 0xFF, b'\n'];
    server_port.write_all(&binary).await.unwrap();
    let seen = read_until(&mut bridge_port, &binary).await;
    assert!(seen.ends_with(&binary));

    // Soft disconnect from the bridge side; both sessions settle.
    bridge_stop.cancel();
    let bridge_summary = bridge_task.await.unwrap().unwrap();
    let server_summary = server_task.await.unwrap().unwrap();

    assert_eq!(bridge_summary.reason, "local shutdown");
    assert_eq!(server_summary.reason, "peer disconnected");
    assert_eq!(server_summary.in_bytes, 6);
    assert_eq!(server_summary.out_bytes, binary.len() as u64);
    let peer = server_summary.peer.expect("server saw the bridge's version frame");
    assert_eq!(peer.role, Role::Bridge);
    assert_eq!(peer.version, soe::BRIDGE_VERSION);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let (server_sock, bridge_sock) = tcp_pair().await;

    let (_server_port, server_task) = spawn_session(
        session_cfg(Role::Server, "SRV-A", Some("secret")),
        Box::new(server_sock),
        CancellationToken::new(),
    );
    let (_bridge_port, bridge_task) = spawn_session(
        session_cfg(Role::Bridge, "BR-A", Some("wrong")),
        Box::new(bridge_sock),
        CancellationToken::new(),
    );

    let bridge_summary = tokio::time::timeout(Duration::from_secs(5), bridge_task)
        .await
        .expect("bridge must be closed promptly")
        .unwrap()
        .unwrap();
    let server_summary = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server session must end")
        .unwrap()
        .unwrap();

    assert_eq!(bridge_summary.reason, "bad password");
    assert_eq!(server_summary.reason, "wrong password from peer");
    // Pre-auth silence: nothing reached either serial endpoint.
    assert_eq!(server_summary.in_bytes, 0);
    assert_eq!(server_summary.out_bytes, 0);
    assert_eq!(bridge_summary.in_bytes, 0);
}

#[tokio::test]
async fn test_server_accepts_again_after_peer_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Minimal accept loop: one session at a time, fresh state per accept.
    let server = tokio::spawn(async move {
        let mut summaries = Vec::new();
        for _ in 0..2 {
            let (sock, _) = listener.accept().await.unwrap();
            let (_port, task) = spawn_session(
                session_cfg(Role::Server, "SRV-A", None),
                Box::new(sock),
                CancellationToken::new(),
            );
            summaries.push(task.await.unwrap().unwrap());
        }
        summaries
    });

    for _ in 0..2 {
        let sock = TcpStream::connect(addr).await.unwrap();
        let stop = CancellationToken::new();
        let (_port, task) =
            spawn_session(session_cfg(Role::Bridge, "BR-A", None), Box::new(sock), stop.clone());
        tokio::time::sleep(Duration::from_millis(400)).await;
        stop.cancel();
        task.await.unwrap().unwrap();
    }

    let summaries = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server must service both sessions")
        .unwrap();
    assert_eq!(summaries.len(), 2);
    for summary in summaries {
        assert_eq!(summary.reason, "peer disconnected");
    }
}

#[tokio::test]
async fn test_unauthenticated_payload_closes_without_badpwd() {
    let (server_sock, raw_sock) = tcp_pair().await;

    let (_port, _server_task) = spawn_session(
        session_cfg(Role::Server, "SRV-A", Some("secret")),
        Box::new(server_sock),
        CancellationToken::new(),
    );

    let (mut rd, mut wr) = raw_sock.into_split();
    // Not a control frame: plain payload before any authentication.
    wr.write_all(b"sneaky payload").await.unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rd.read(&mut buf)).await {
            Ok(Ok(0)) => break, // server closed on us, as specified
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
            Err(_) => panic!("server did not close the connection"),
        }
    }
    let text = String::from_utf8_lossy(&collected);
    assert!(!text.contains("BADPWD"), "protocol misuse gets a plain close, got {text:?}");
}

#[tokio::test]
async fn test_bridge_wire_intro_and_keepalive() {
    let (raw_sock, bridge_sock) = tcp_pair().await;

    let mut cfg = session_cfg(Role::Bridge, "BR-A", Some("pw"));
    cfg.keepalive = 1;
    let (_port, _task) = spawn_session(cfg, Box::new(bridge_sock), CancellationToken::new());

    let (mut rd, mut wr) = raw_sock.into_split();
    // Play the server's opening.
    wr.write_all(b"__#GETVER#____#GET_KA_TIMEOUT#__").await.unwrap();

    let intro = read_until(&mut rd, b"__#ASK_COM_PARAMS#__").await;
    let intro = String::from_utf8_lossy(&intro).into_owned();
    assert!(
        intro.contains(&format!("__#BR_VER_{}#__", soe::BRIDGE_VERSION)),
        "got {intro:?}"
    );
    assert!(intro.contains("__#MY_KA_TIMEOUT_1#__"), "got {intro:?}");
    // The password leads the introduction.
    let pwd_at = intro.find("__#PWD_pw#__").expect("bridge must authenticate");
    let ask_at = intro.find("__#ASK_COM_PARAMS#__").unwrap();
    assert!(pwd_at < ask_at, "password must precede the questions: {intro:?}");

    // Once authorised, keep-alives tick at the configured interval.
    read_until(&mut rd, b"__#KEEPALIVE#__").await;
}

#[tokio::test]
async fn test_server_wire_handshake_exchange() {
    let (server_sock, raw_sock) = tcp_pair().await;

    // Servers default to a 120 s keep-alive interval.
    let mut cfg = session_cfg(Role::Server, "SRV-A", None);
    cfg.keepalive = 120;
    let (_port, _task) = spawn_session(cfg, Box::new(server_sock), CancellationToken::new());

    let (mut rd, mut wr) = raw_sock.into_split();

    // The server opens with its two questions.
    let opening = read_until(&mut rd, b"__#GET_KA_TIMEOUT#__").await;
    let opening = String::from_utf8_lossy(&opening).into_owned();
    assert!(opening.contains("__#GETVER#__"), "got {opening:?}");

    // Answer like a bridge and ask our own questions.
    wr.write_all(b"__#BR_VER_0.0.70#____#MY_KA_TIMEOUT_30#__").await.unwrap();
    wr.write_all(b"__#GETVER#____#ASK_COM_PARAMS#__").await.unwrap();

    let replies = read_until(&mut rd, b"__#COM_PARAMS_SRV-A 9600 8N1N#__").await;
    let replies = String::from_utf8_lossy(&replies).into_owned();
    assert!(
        replies.contains(&format!("__#SRV_VER_{}#__", soe::SERVER_VERSION)),
        "got {replies:?}"
    );
    assert!(replies.contains("__#MY_KA_TIMEOUT_120#__"), "got {replies:?}");
}
