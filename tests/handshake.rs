//! End-to-end tests of the opening handshake over an in-memory stream.

use scheelite::{
    DefaultEndpoint, Error, Handler, HandshakeError, Role, Session, SessionConfig, SessionHandle,
    SessionState,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const GOOD_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
    Host: server.example.com\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Origin: http://example.com\r\n\
    \r\n";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spawn_server<H: Handler + 'static>(
    stream: DuplexStream,
    handler: H,
) -> tokio::task::JoinHandle<(Session<DuplexStream>, scheelite::Result<()>)> {
    tokio::spawn(async move {
        let mut session = Session::accept(
            stream,
            handler,
            Arc::new(DefaultEndpoint::default()),
            SessionConfig::default(),
        );
        let result = session.run().await;
        (session, result)
    })
}

async fn read_response_head(stream: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn v13_handshake_is_accepted() {
    init_logging();
    let (mut client, server) = tokio::io::duplex(4096);
    let task = spawn_server(server, scheelite::NoHandler);

    client.write_all(GOOD_REQUEST).await.unwrap();
    let response = read_response_head(&mut client).await;

    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(response.contains("Upgrade: websocket\r\n"));
    assert!(response.contains("Connection: Upgrade\r\n"));

    drop(client);
    let (session, result) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(session.handle().state(), SessionState::Closed);
    assert_eq!(session.handle().resource(), "/chat");
    assert_eq!(session.handle().origin(), "http://example.com");
    assert_eq!(session.handle().version(), 13);
}

#[tokio::test]
async fn request_arriving_in_small_pieces_is_reassembled() {
    init_logging();
    let (mut client, server) = tokio::io::duplex(4096);
    let task = spawn_server(server, scheelite::NoHandler);

    for chunk in GOOD_REQUEST.chunks(7) {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
    }
    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 101"));

    drop(client);
    task.await.unwrap();
}

#[tokio::test]
async fn missing_upgrade_header_yields_400() {
    init_logging();
    let (mut client, server) = tokio::io::duplex(4096);
    let task = spawn_server(server, scheelite::NoHandler);

    let request = String::from_utf8(GOOD_REQUEST.to_vec())
        .unwrap()
        .replace("Upgrade: websocket\r\n", "");
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 400 "));

    let (session, result) = task.await.unwrap();
    assert!(matches!(result, Err(Error::Handshake(_))));
    assert_eq!(session.handle().state(), SessionState::Closed);
    assert!(session.handle().dropped_by_me());
}

#[tokio::test]
async fn validate_callback_can_reject_with_custom_status() {
    init_logging();

    struct Picky;
    impl Handler for Picky {
        fn validate(&mut self, session: &mut SessionHandle) -> Result<(), HandshakeError> {
            if session.origin() != "https://trusted.example.com" {
                return Err(HandshakeError::new(403, "untrusted origin"));
            }
            Ok(())
        }
    }

    let (mut client, server) = tokio::io::duplex(4096);
    let task = spawn_server(server, Picky);

    client.write_all(GOOD_REQUEST).await.unwrap();
    let response = read_response_head(&mut client).await;
    assert_eq!(response, "HTTP/1.1 403 untrusted origin\r\n\r\n");

    let (_, result) = task.await.unwrap();
    assert!(matches!(result, Err(Error::Handshake(_))));
}

#[tokio::test]
async fn validate_callback_sets_headers_and_subprotocol() {
    init_logging();

    struct Negotiator;
    impl Handler for Negotiator {
        fn validate(&mut self, session: &mut SessionHandle) -> Result<(), HandshakeError> {
            session.set_header("X-Session-Tag", "abc123");
            session
                .select_subprotocol("superchat")
                .map_err(|_| HandshakeError::from_code(500))
        }
    }

    let (mut client, server) = tokio::io::duplex(4096);
    let task = spawn_server(server, Negotiator);

    let request = String::from_utf8(GOOD_REQUEST.to_vec()).unwrap().replace(
        "Origin:",
        "Sec-WebSocket-Protocol: chat, superchat\r\nOrigin:",
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains("Sec-WebSocket-Protocol: superchat\r\n"));
    assert!(response.contains("X-Session-Tag: abc123\r\n"));

    drop(client);
    let (session, _) = task.await.unwrap();
    assert_eq!(session.handle().subprotocol(), "superchat");
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_dropped_after_handshake_timeout() {
    init_logging();
    let (mut client, server) = tokio::io::duplex(4096);

    struct CountOpens(Arc<AtomicUsize>);
    impl Handler for CountOpens {
        fn on_open(&mut self, _session: &mut SessionHandle) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let opens = Arc::new(AtomicUsize::new(0));
    let task = spawn_server(server, CountOpens(opens.clone()));

    // The client never sends a byte. After the handshake timeout the
    // session must drop TCP without having written a response.
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "no HTTP response may be written on timeout");

    let (session, result) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(session.handle().state(), SessionState::Closed);
    assert!(session.handle().dropped_by_me());
    assert_eq!(opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_header_trickle_still_times_out() {
    init_logging();
    let (mut client, server) = tokio::io::duplex(4096);
    let task = spawn_server(server, scheelite::NoHandler);

    // A few bytes arrive, then the peer stalls forever.
    client.write_all(b"GET /chat HTT").await.unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    let (session, _) = task.await.unwrap();
    assert!(session.handle().dropped_by_me());
}

#[tokio::test]
async fn client_role_sessions_skip_the_handshake() {
    init_logging();
    let (mut peer, stream) = tokio::io::duplex(4096);

    struct Greet;
    impl Handler for Greet {
        fn on_open(&mut self, session: &mut SessionHandle) {
            session.send("hi");
        }
    }

    let task = tokio::spawn(async move {
        let mut session = Session::from_upgraded(
            stream,
            Role::Client,
            Greet,
            Arc::new(DefaultEndpoint::default()),
            SessionConfig::default(),
        );
        let result = session.run().await;
        (session, result)
    });

    // The first bytes on the wire are a masked text frame, not HTTP.
    let mut header = [0u8; 2];
    peer.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x81);
    assert_eq!(header[1], 0x80 | 2, "client frames must be masked");

    let mut rest = [0u8; 6];
    peer.read_exact(&mut rest).await.unwrap();
    let (mask, payload) = rest.split_at(4);
    let unmasked: Vec<u8> = payload.iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m).collect();
    assert_eq!(unmasked, b"hi");

    drop(peer);
    task.await.unwrap();
}
