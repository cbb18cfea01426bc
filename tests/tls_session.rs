//! TLS auto-mode end-to-end: ephemeral certificate, password auth, byte
//! transparency through the encrypted tunnel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use soe::net::tls::{ClientTls, ServerTls, TlsMode};
use soe::session::{run_session, Role, SessionConfig};
use soe::status::NullStatus;
use soe::{BoxLink, LineFormat, SerialConfig};

#[tokio::test]
async fn test_auto_tls_session_with_password() {
    // Auto mode writes temp.crt / temp.key relative to the working
    // directory; run the whole test from a scratch dir.
    let scratch = tempfile::tempdir().unwrap();
    let prev_cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(scratch.path()).unwrap();
    let _restore = scopeguard::guard(prev_cwd, |prev| {
        let _ = std::env::set_current_dir(prev);
    });

    let server_tls = ServerTls::from_mode(&TlsMode::Auto).unwrap().unwrap();
    let client_tls = ClientTls::from_mode(&TlsMode::Auto).unwrap().unwrap();
    assert!(scratch.path().join("temp.crt").exists());
    assert!(scratch.path().join("temp.key").exists());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cfg = |role| SessionConfig {
        role,
        serial: SerialConfig::new("TLS-PORT", 9600, LineFormat::default()).unwrap(),
        password: Some("p".to_string()),
        keepalive: 30,
    };

    let (server_serial, mut server_outside) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let link = server_tls.accept(sock).await.unwrap();
        run_session(
            cfg(Role::Server),
            link,
            Box::new(server_serial) as BoxLink,
            CancellationToken::new(),
            Arc::new(NullStatus),
        )
        .await
        .unwrap()
    });

    let (bridge_serial, mut bridge_outside) = tokio::io::duplex(4096);
    let bridge_stop = CancellationToken::new();
    let bridge_task = tokio::spawn({
        let stop = bridge_stop.clone();
        async move {
            let sock = TcpStream::connect(addr).await.unwrap();
            let link = client_tls.connect("127.0.0.1", sock).await.unwrap();
            run_session(
                cfg(Role::Bridge),
                link,
                Box::new(bridge_serial) as BoxLink,
                stop,
                Arc::new(NullStatus),
            )
            .await
            .unwrap()
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;

    // The certificate files are disposable once the config is built.
    std::fs::remove_file(scratch.path().join("temp.crt")).unwrap();
    std::fs::remove_file(scratch.path().join("temp.key")).unwrap();

    bridge_outside.write_all(b"over tls\n").await.unwrap();
    let mut collected = Vec::new();
    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !collected.ends_with(b"over tls\n") {
        let n = tokio::time::timeout_at(deadline, server_outside.read(&mut buf))
            .await
            .expect("payload must arrive through the tunnel")
            .unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }

    bridge_stop.cancel();
    let bridge_summary = bridge_task.await.unwrap();
    let server_summary = server_task.await.unwrap();
    assert_eq!(server_summary.in_bytes, b"over tls\n".len() as u64);
    assert_eq!(bridge_summary.out_bytes, b"over tls\n".len() as u64);
}
