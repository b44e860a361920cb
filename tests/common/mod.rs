//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cors_ws_proxy::config::ProxyConfig;
use cors_ws_proxy::http::websocket::session::SessionTracker;
use cors_ws_proxy::http::HttpServer;
use cors_ws_proxy::lifecycle::Shutdown;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;

/// Request heads (request line plus headers) seen by a backend, in arrival order.
pub type Recorded = Arc<Mutex<Vec<String>>>;

/// A proxy running on an ephemeral port. Dropping it shuts the server down.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub sessions: SessionTracker,
    _shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

/// Start the proxy in front of `upstream`.
pub async fn start_proxy(upstream: &str) -> TestProxy {
    start_proxy_with(upstream, |_| {}).await
}

/// Start the proxy in front of `upstream`, with `configure` applied to the
/// default config first.
pub async fn start_proxy_with(upstream: &str, configure: impl FnOnce(&mut ProxyConfig)) -> TestProxy {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.url = upstream.into();
    configure(&mut config);

    let server = HttpServer::new(config).unwrap();
    let sessions = server.sessions();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    TestProxy {
        addr,
        sessions,
        _shutdown: shutdown,
    }
}

/// A loopback address nobody listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Plain HTTP client that never reuses connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Read one request head and its Content-Length body from `socket`.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    String::from_utf8_lossy(&buf).to_string()
}

/// Start a backend that records each request and answers with `response`
/// verbatim (a full HTTP/1.1 response, headers and body).
pub async fn start_recording_backend(response: String) -> (SocketAddr, Recorded) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded: Recorded = Arc::default();
    let seen = recorded.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let seen = seen.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                seen.lock().unwrap().push(request);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
    });

    (addr, recorded)
}

/// A `200 OK` response with extra raw header lines and a body.
pub fn ok_response(extra_headers: &[&str], body: &str) -> String {
    let mut response = String::from("HTTP/1.1 200 OK\r\n");
    for line in extra_headers {
        response.push_str(line);
        response.push_str("\r\n");
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    response
}

/// Case-insensitive lookup of a header value in a recorded request head.
pub fn header_in(request: &str, name: &str) -> Option<String> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

/// Behaviour of the websocket backend once a client is connected.
#[derive(Clone)]
pub enum WsBehaviour {
    /// Send every message back.
    Echo,
    /// Close right away with this code and reason.
    CloseWith(u16, &'static str),
    /// Send this many text messages (`tick 0`, `tick 1`, ...) this far apart,
    /// then only read.
    Ticks(usize, Duration),
    /// Report every message received, then `None` once the stream ends.
    Collect(mpsc::UnboundedSender<Option<Message>>),
}

/// Start a websocket backend. It accepts protocol `chat`, sets two cookies
/// plus an `X-Backend` header on the handshake, and records request heads.
pub async fn start_ws_backend(behaviour: WsBehaviour) -> (SocketAddr, Recorded) {
    start_ws_backend_choosing(behaviour, Some("chat")).await
}

/// Like [`start_ws_backend`], but answers with `protocol` whatever the
/// client asked for, or with no protocol at all.
pub async fn start_ws_backend_choosing(
    behaviour: WsBehaviour,
    protocol: Option<&'static str>,
) -> (SocketAddr, Recorded) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded: Recorded = Arc::default();
    let seen = recorded.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let seen = seen.clone();
            let behaviour = behaviour.clone();
            tokio::spawn(async move {
                let callback = |request: &Request,
                                mut response: Response|
                 -> Result<Response, ErrorResponse> {
                    let mut head = format!("{} {}\r\n", request.method(), request.uri());
                    for (name, value) in request.headers() {
                        head.push_str(&format!(
                            "{}: {}\r\n",
                            name,
                            value.to_str().unwrap_or_default()
                        ));
                    }
                    seen.lock().unwrap().push(head);

                    let headers = response.headers_mut();
                    if let Some(protocol) = protocol {
                        headers.insert("sec-websocket-protocol", HeaderValue::from_static(protocol));
                    }
                    headers.append("set-cookie", HeaderValue::from_static("a=1"));
                    headers.append("set-cookie", HeaderValue::from_static("b=2"));
                    headers.insert("x-backend", HeaderValue::from_static("yes"));
                    Ok(response)
                };

                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
                    return;
                };

                match behaviour {
                    WsBehaviour::Echo => {
                        while let Some(Ok(message)) = ws.next().await {
                            if message.is_close() {
                                break;
                            }
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                    }
                    WsBehaviour::CloseWith(code, reason) => {
                        let _ = ws
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        // Drain until the peer answers the close.
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                    WsBehaviour::Ticks(count, every) => {
                        for n in 0..count {
                            tokio::time::sleep(every).await;
                            if ws.send(Message::text(format!("tick {n}"))).await.is_err() {
                                return;
                            }
                        }
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                    WsBehaviour::Collect(received) => {
                        while let Some(Ok(message)) = ws.next().await {
                            let _ = received.send(Some(message));
                        }
                        let _ = received.send(None);
                    }
                }
            });
        }
    });

    (addr, recorded)
}

/// Send a websocket upgrade by hand and read the response head byte by byte,
/// so nothing after it is consumed. The key is the RFC 6455 sample nonce.
pub async fn raw_upgrade(addr: SocketAddr, path: &str, extra_headers: &[&str]) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"
    );
    for line in extra_headers {
        request.push_str(line);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    (String::from_utf8_lossy(&head).to_string(), stream)
}

/// Wait until `tracker` drops to zero, or give up after two seconds.
pub async fn wait_for_release(tracker: &SessionTracker) -> u64 {
    for _ in 0..200 {
        if tracker.active_count() == 0 {
            return 0;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracker.active_count()
}
