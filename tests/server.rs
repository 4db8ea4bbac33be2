use futures_util::{SinkExt, StreamExt};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use webtty::protocol::{self, MessageType};
use webtty::pty::BackendKind;
use webtty::session::SessionRegistry;
use webtty::tls::CertInfo;
use webtty::transport::stream::{StreamSink, StreamSource};
use webtty::transport::{FrameSink, FrameSource};
use webtty::{Config, Server, Terminal, WindowSize, program_handler};
use wtransport::tls::Sha256Digest;
use wtransport::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, VarInt};

const WAIT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    registry: SessionRegistry,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn wt_url(&self) -> String {
        format!("https://127.0.0.1:{}/webtransport", self.addr.port() + 1)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        webtransport: false,
        handshake_timeout_ms: 1_000,
        ..Config::default()
    }
}

fn echo_server(config: Config) -> Server {
    let handler = program_handler(|_info| {
        Ok(|mut terminal: Terminal| -> anyhow::Result<()> {
            let size = terminal.size();
            write!(terminal, "ready {size}\r\n")?;
            let mut buf = [0u8; 1024];
            loop {
                let n = terminal.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                terminal.write_all(&buf[..n])?;
            }
        })
    });
    Server::with_program(config, handler).with_backend(BackendKind::Pipe)
}

async fn start(server: Server) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    let registry = server.registry();
    let task = tokio::spawn(server.serve(listener));
    TestServer {
        addr,
        shutdown,
        registry,
        task,
    }
}

async fn send(ws: &mut Ws, kind: MessageType, payload: &[u8]) {
    ws.send(Message::binary(protocol::encode_message(kind, payload)))
        .await
        .unwrap();
}

async fn send_resize(ws: &mut Ws, cols: u16, rows: u16) {
    let payload = protocol::resize_payload(WindowSize::new(cols, rows));
    send(ws, MessageType::Resize, &payload).await;
}

/// Next protocol message; `None` once the server closed the socket.
async fn next_message(ws: &mut Ws) -> Option<(MessageType, Vec<u8>)> {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("server went quiet")?;
        match message.ok()? {
            Message::Binary(data) => {
                let (kind, payload) = protocol::split_message(&data).unwrap();
                return Some((MessageType::from_byte(kind).unwrap(), payload.to_vec()));
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn read_output_until(ws: &mut Ws, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        let (kind, payload) = next_message(ws).await.expect("connection ended");
        if kind == MessageType::Output {
            output.push_str(&String::from_utf8_lossy(&payload));
        }
    }
    output
}

async fn wait_until_empty(registry: &SessionRegistry) {
    tokio::time::timeout(WAIT, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sessions were not removed");
}

#[tokio::test]
async fn websocket_session_echoes_input() {
    let server = start(echo_server(test_config())).await;
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();

    send_resize(&mut ws, 100, 40).await;
    let (kind, payload) = next_message(&mut ws).await.unwrap();
    assert_eq!(kind, MessageType::Options);
    assert!(!protocol::parse_options(&payload).unwrap().read_only);
    read_output_until(&mut ws, "ready 100x40").await;

    send(&mut ws, MessageType::Input, b"hello webtty").await;
    read_output_until(&mut ws, "hello webtty").await;
    assert_eq!(server.registry.len(), 1);

    ws.close(None).await.unwrap();
    wait_until_empty(&server.registry).await;
    server.stop().await;
}

#[tokio::test]
async fn health_and_disabled_cert_hash() {
    let server = start(echo_server(test_config())).await;

    let health = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "OK");

    let cert = reqwest::get(format!("http://{}/cert-hash", server.addr))
        .await
        .unwrap();
    assert_eq!(cert.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn cert_hash_describes_webtransport_endpoint() {
    let cert = CertInfo::self_signed("localhost").unwrap();
    let expected: Vec<u8> = cert.hash().to_vec();
    let config = Config {
        webtransport: true,
        ..test_config()
    };
    let server = start(echo_server(config).with_certificate(cert)).await;

    let response = reqwest::get(format!("http://{}/cert-hash", server.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["cache-control"].to_str().unwrap(),
        "no-store"
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["algorithm"], "sha-256");
    let hash: Vec<u8> = serde_json::from_value(body["hashBytes"].clone()).unwrap();
    assert_eq!(hash, expected);
    let url = body["wtUrl"].as_str().unwrap();
    assert_eq!(
        url,
        format!("https://127.0.0.1:{}/webtransport", server.addr.port() + 1)
    );

    server.stop().await;
}

#[tokio::test]
async fn connection_limit_rejects_and_recovers() {
    let config = Config {
        max_connections: 1,
        ..test_config()
    };
    let server = start(echo_server(config)).await;

    let (mut first, _) = connect_async(server.ws_url()).await.unwrap();
    send_resize(&mut first, 80, 24).await;
    read_output_until(&mut first, "ready").await;

    match connect_async(server.ws_url()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected 503, got {:?}", other.map(|(_, r)| r.status())),
    }

    first.close(None).await.unwrap();
    wait_until_empty(&server.registry).await;

    let mut admitted = None;
    for _ in 0..50 {
        if let Ok((ws, _)) = connect_async(server.ws_url()).await {
            admitted = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut again = admitted.expect("capacity was not released");
    send_resize(&mut again, 80, 24).await;
    read_output_until(&mut again, "ready").await;

    server.stop().await;
}

#[tokio::test]
async fn foreign_origin_is_forbidden() {
    let config = Config {
        allow_origins: vec!["example.com".to_string()],
        ..test_config()
    };
    let server = start(echo_server(config)).await;

    let mut request = server.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.test".parse().unwrap());
    match connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 403);
        }
        other => panic!("expected 403, got {:?}", other.map(|(_, r)| r.status())),
    }

    let mut request = server.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://example.com".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();
    send_resize(&mut ws, 80, 24).await;
    read_output_until(&mut ws, "ready").await;

    server.stop().await;
}

#[tokio::test]
async fn shutdown_ends_open_sessions() {
    let server = start(echo_server(test_config())).await;
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    send_resize(&mut ws, 80, 24).await;
    read_output_until(&mut ws, "ready").await;

    let registry = server.registry.clone();
    server.stop().await;
    assert!(registry.is_empty());

    while next_message(&mut ws).await.is_some() {}
}

#[cfg(unix)]
#[tokio::test]
async fn exiting_command_sends_output_then_close() {
    use webtty::CommandSpec;

    let command = CommandSpec::new("sh").args(["-c", "printf done"]);
    let server = start(Server::with_command(test_config(), command)).await;
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    send_resize(&mut ws, 80, 24).await;

    let mut output = Vec::new();
    let mut last = None;
    while let Some((kind, payload)) = next_message(&mut ws).await {
        if kind == MessageType::Output {
            output.extend_from_slice(&payload);
        }
        last = Some(kind);
    }
    assert_eq!(last, Some(MessageType::Close));
    assert!(String::from_utf8_lossy(&output).contains("done"));

    wait_until_empty(&server.registry).await;
    server.stop().await;
}

struct WtClient {
    sink: StreamSink<SendStream>,
    source: StreamSource<RecvStream>,
    connection: Connection,
}

impl WtClient {
    async fn connect(url: &str, cert: &CertInfo) -> anyhow::Result<Self> {
        let config = ClientConfig::builder()
            .with_bind_default()
            .with_server_certificate_hashes([Sha256Digest::new(*cert.hash())])
            .build();
        let connection = Endpoint::client(config)?.connect(url).await?;
        let (send, recv) = connection.open_bi().await?.await?;
        Ok(Self {
            sink: StreamSink::new(send),
            source: StreamSource::new(recv),
            connection,
        })
    }

    async fn resize(&mut self, cols: u16, rows: u16) {
        let payload = protocol::resize_payload(WindowSize::new(cols, rows));
        self.sink.send(MessageType::Resize, &payload).await.unwrap();
    }

    /// Next protocol message; `None` once the stream or connection ended.
    async fn next(&mut self) -> Option<(MessageType, Vec<u8>)> {
        let message = tokio::time::timeout(WAIT, self.source.recv())
            .await
            .expect("server went quiet")
            .ok()??;
        let (kind, payload) = protocol::split_message(&message).unwrap();
        Some((MessageType::from_byte(kind).unwrap(), payload.to_vec()))
    }

    /// Output bytes and the last message kind, read until the server is done.
    async fn read_to_end(&mut self) -> (Vec<u8>, Option<MessageType>) {
        let mut output = Vec::new();
        let mut last = None;
        while let Some((kind, payload)) = self.next().await {
            if kind == MessageType::Output {
                output.extend_from_slice(&payload);
            }
            last = Some(kind);
        }
        (output, last)
    }
}

fn webtransport_config() -> Config {
    Config {
        webtransport: true,
        ..test_config()
    }
}

#[cfg(unix)]
async fn run_command_over_webtransport(script: &str) -> (Vec<u8>, Option<MessageType>) {
    use webtty::CommandSpec;

    let cert = CertInfo::self_signed("localhost").unwrap();
    let command = CommandSpec::new("sh").args(["-c", script]);
    let server = Server::with_command(webtransport_config(), command).with_certificate(cert.clone());
    let server = start(server).await;

    let mut client = WtClient::connect(&server.wt_url(), &cert).await.unwrap();
    client.resize(80, 24).await;
    let (kind, _) = client.next().await.unwrap();
    assert_eq!(kind, MessageType::Options);
    let result = client.read_to_end().await;

    drop(client);
    wait_until_empty(&server.registry).await;
    server.stop().await;
    result
}

#[cfg(unix)]
#[tokio::test]
async fn webtransport_command_sends_output_then_close() {
    for _ in 0..5 {
        let (output, last) = run_command_over_webtransport("printf done").await;
        assert_eq!(last, Some(MessageType::Close));
        assert!(String::from_utf8_lossy(&output).contains("done"));
    }
}

#[cfg(unix)]
#[tokio::test]
async fn webtransport_delivers_large_output_in_full() {
    let script = "head -c 200000 /dev/zero | tr '\\0' a";
    let (output, last) = run_command_over_webtransport(script).await;
    assert_eq!(last, Some(MessageType::Close));
    assert_eq!(output.iter().filter(|&&b| b == b'a').count(), 200_000);
}

#[tokio::test]
async fn webtransport_limit_rejects_second_session() {
    let cert = CertInfo::self_signed("localhost").unwrap();
    let config = Config {
        max_connections: 1,
        ..webtransport_config()
    };
    let server = start(echo_server(config).with_certificate(cert.clone())).await;

    let mut first = WtClient::connect(&server.wt_url(), &cert).await.unwrap();
    first.resize(100, 40).await;
    let mut output = String::new();
    while !output.contains("ready 100x40") {
        let (kind, payload) = first.next().await.expect("connection ended");
        if kind == MessageType::Output {
            output.push_str(&String::from_utf8_lossy(&payload));
        }
    }

    assert!(WtClient::connect(&server.wt_url(), &cert).await.is_err());
    assert_eq!(server.registry.len(), 1);

    first.sink.finish().await;
    first.connection.close(VarInt::from_u32(0), b"done");
    wait_until_empty(&server.registry).await;
    server.stop().await;
}
