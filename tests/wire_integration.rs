//! Black-box tests driving the server over real loopback sockets,
//! including the cleartext-to-TLS upgrade against a self-signed
//! certificate.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use vireo::query::LocalBackend;
use vireo::server::Server;
use vireo::tasks::WorkerPool;
use vireo::transport::TlsContext;

/// A test server wrapper; the accept loop is aborted on drop.
struct TestServer {
    port: u16,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(tls: Option<TlsContext>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Server::new(listener, Arc::new(LocalBackend), WorkerPool::new(2), tls);
        let handle = tokio::spawn(async move {
            let _ = server.serve().await;
        });
        Self { port, handle }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn startup_message(params: &[(&str, &str)]) -> Vec<u8> {
    let mut body = (3i32 << 16).to_be_bytes().to_vec();
    for (name, value) in params {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    let mut message = ((body.len() as u32) + 4).to_be_bytes().to_vec();
    message.extend_from_slice(&body);
    message
}

/// SSLRequest: Int32(8) Int32(80877103), no type byte.
fn ssl_request() -> Vec<u8> {
    let mut message = 8u32.to_be_bytes().to_vec();
    message.extend_from_slice(&80877103i32.to_be_bytes());
    message
}

/// Query: Byte1('Q') Int32(len) String(sql).
fn query_message(sql: &str) -> Vec<u8> {
    let mut message = vec![b'Q'];
    message.extend_from_slice(&((sql.len() as u32) + 5).to_be_bytes());
    message.extend_from_slice(sql.as_bytes());
    message.push(0);
    message
}

/// Terminate: Byte1('X') Int32(4).
fn terminate_message() -> Vec<u8> {
    let mut message = vec![b'X'];
    message.extend_from_slice(&4u32.to_be_bytes());
    message
}

/// Reads framed backend messages until one of type `until` (inclusive).
fn read_messages(stream: &mut impl Read, until: u8) -> Vec<(u8, Vec<u8>)> {
    let mut messages = Vec::new();
    loop {
        let mut ty = [0u8; 1];
        stream.read_exact(&mut ty).unwrap();
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let body_len = u32::from_be_bytes(len) as usize - 4;
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).unwrap();
        messages.push((ty[0], body));
        if ty[0] == until {
            return messages;
        }
    }
}

fn message_types(messages: &[(u8, Vec<u8>)]) -> Vec<u8> {
    messages.iter().map(|(ty, _)| *ty).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trivial_startup() {
    let server = TestServer::start(None).await;
    let mut stream = server.connect();

    // length=8, protocol 3.0, no parameters.
    stream
        .write_all(&[0x00, 0x00, 0x00, 0x08, 0x00, 0x03, 0x00, 0x00])
        .unwrap();

    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(messages[0].0, b'R');
    assert_eq!(messages[0].1, vec![0, 0, 0, 0]);
    let types = message_types(&messages);
    assert!(types.contains(&b'S'));
    assert!(types.contains(&b'K'));
    assert_eq!(*types.last().unwrap(), b'Z');

    // The session is usable afterwards.
    stream.write_all(&terminate_message()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ssl_request_declined_without_certificates() {
    let server = TestServer::start(None).await;
    let mut stream = server.connect();

    stream.write_all(&ssl_request()).unwrap();

    // The answer is a single naked byte, no framing.
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).unwrap();
    assert_eq!(answer[0], b'N');

    // Cleartext startup still works afterwards.
    stream
        .write_all(&startup_message(&[("user", "alice")]))
        .unwrap();
    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(messages[0].0, b'R');
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_startup_fragmented_byte_by_byte() {
    let server = TestServer::start(None).await;
    let mut stream = server.connect();

    for &byte in &startup_message(&[("user", "alice")]) {
        stream.write_all(&[byte]).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(messages[0].0, b'R');
    assert_eq!(*message_types(&messages).last().unwrap(), b'Z');
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_startup_payload() {
    let server = TestServer::start(None).await;
    let mut stream = server.connect();

    // Startup packet much larger than the 8 KiB socket buffer.
    let padding = "x".repeat(32 * 1024);
    let message = startup_message(&[("user", "alice"), ("padding", &padding)]);
    assert!(message.len() > 8192);
    stream.write_all(&message).unwrap();

    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(messages[0].0, b'R');
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_deferred_round_trip() {
    let server = TestServer::start(None).await;
    let mut stream = server.connect();

    stream
        .write_all(&startup_message(&[("user", "alice")]))
        .unwrap();
    read_messages(&mut stream, b'Z');

    // The stub backend answers every real query with a well-formed
    // error and keeps the session alive.
    stream.write_all(&query_message("SELECT 1")).unwrap();
    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(message_types(&messages), vec![b'E', b'Z']);

    // Empty query has its own response.
    stream.write_all(&query_message("")).unwrap();
    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(message_types(&messages), vec![b'I', b'Z']);

    // Terminate: the server closes without further output.
    stream.write_all(&terminate_message()).unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_message_type_keeps_session() {
    let server = TestServer::start(None).await;
    let mut stream = server.connect();

    stream
        .write_all(&startup_message(&[("user", "alice")]))
        .unwrap();
    read_messages(&mut stream, b'Z');

    // 'F' (function call) is not supported here.
    stream.write_all(&[b'F', 0, 0, 0, 4]).unwrap();
    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(message_types(&messages), vec![b'E', b'Z']);

    // Still alive.
    stream.write_all(&query_message("")).unwrap();
    let messages = read_messages(&mut stream, b'Z');
    assert_eq!(message_types(&messages), vec![b'I', b'Z']);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tls_upgrade_end_to_end() {
    // Self-signed certificate for localhost.
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::pki_types::CertificateDer::from(cert_der.clone())],
            rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
                key_der,
            )),
        )
        .unwrap();
    let server = TestServer::start(Some(TlsContext::new(Arc::new(server_config)))).await;

    let mut stream = server.connect();
    stream.write_all(&ssl_request()).unwrap();

    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).unwrap();
    assert_eq!(answer[0], b'S');

    // Wrap the same socket in a TLS client session that trusts the
    // self-signed certificate.
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(cert_der))
        .unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let session = rustls::ClientConnection::new(Arc::new(client_config), server_name).unwrap();
    let mut tls_stream = rustls::StreamOwned::new(session, stream);

    // All application bytes now travel encrypted.
    tls_stream
        .write_all(&startup_message(&[("user", "alice")]))
        .unwrap();
    let messages = read_messages(&mut tls_stream, b'Z');
    assert_eq!(messages[0].0, b'R');
    let types = message_types(&messages);
    assert!(types.contains(&b'K'));

    tls_stream.write_all(&query_message("SELECT 1")).unwrap();
    let messages = read_messages(&mut tls_stream, b'Z');
    assert_eq!(message_types(&messages), vec![b'E', b'Z']);

    tls_stream.write_all(&terminate_message()).unwrap();
}
