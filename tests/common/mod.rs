//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::{header, HeaderMap};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use websocket_proxy::{HttpServer, ProxyConfig, Shutdown, WebsocketProxy};

/// Bound on every wait in the integration tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake request as the backend saw it.
#[derive(Debug, Clone)]
pub struct Captured {
    pub uri: String,
    pub headers: HeaderMap,
}

/// Handshakes recorded by a mock backend.
#[derive(Debug, Clone, Default)]
pub struct Handshakes(Arc<Mutex<Vec<Captured>>>);

impl Handshakes {
    pub fn last(&self) -> Captured {
        self.0.lock().unwrap().last().cloned().expect("no handshake recorded")
    }

    fn record(&self, request: &HsRequest) {
        self.0.lock().unwrap().push(Captured {
            uri: request.uri().to_string(),
            headers: request.headers().clone(),
        });
    }
}

/// What a mock WebSocket backend does once the handshake is done.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Send every data message back.
    Echo,
    /// Close immediately with this code and reason.
    Close(u16, &'static str),
    /// Drop the TCP connection right after the handshake, no close frame.
    Drop,
}

/// Start a WebSocket backend on an ephemeral port.
///
/// The backend records each handshake, agrees to the first requested
/// subprotocol and sets a `backend=1` cookie on its 101.
pub async fn start_ws_backend(behavior: Behavior) -> (SocketAddr, Handshakes) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handshakes = Handshakes::default();

    let recorder = handshakes.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let recorder = recorder.clone();
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let callback = |request: &HsRequest, mut response: HsResponse| {
                    recorder.record(request);
                    response
                        .headers_mut()
                        .append(header::SET_COOKIE, "backend=1".parse().unwrap());
                    let protocol = request
                        .headers()
                        .get(header::SEC_WEBSOCKET_PROTOCOL)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.split(',').next())
                        .map(|value| value.trim().to_string());
                    if let Some(protocol) = protocol {
                        response
                            .headers_mut()
                            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol.parse().unwrap());
                    }
                    Ok::<_, ErrorResponse>(response)
                };

                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
                    return;
                };

                match behavior {
                    Behavior::Echo => {
                        while let Some(Ok(message)) = ws.next().await {
                            if message.is_text() || message.is_binary() {
                                if ws.send(message).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Behavior::Close(code, reason) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws.close(Some(frame)).await;
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                    Behavior::Drop => drop(ws),
                }
            });
        }
    });

    (addr, handshakes)
}

/// Start a backend that answers every request with `chunks` verbatim,
/// pausing between chunks so each lands in its own TCP segment.
pub async fn start_http_backend(chunks: &'static [&'static str]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                for chunk in chunks {
                    let _ = socket.write_all(chunk.as_bytes()).await;
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A running proxy server.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub proxy: WebsocketProxy,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

/// Serve `proxy` on an ephemeral port.
pub async fn start_proxy(proxy: WebsocketProxy) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    let server = HttpServer::with_proxy(ProxyConfig::default(), proxy.clone());
    let stop = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, stop).await;
    });

    TestProxy {
        addr,
        proxy,
        shutdown,
    }
}

/// Serve a caller-built router, for tests that layer their own middleware
/// in front of the proxy.
pub async fn serve_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// Proxy to `backend` with default settings.
pub async fn start_proxy_to(backend: SocketAddr, base: &str) -> TestProxy {
    let target = url::Url::parse(&format!("http://{backend}{base}")).unwrap();
    start_proxy(WebsocketProxy::single_host(target)).await
}

/// Send a raw HTTP/1.1 request that asks the server to close afterwards,
/// and return everything it answered.
pub async fn raw_request(addr: SocketAddr, head: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("response not finished in time")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Receive the next message, failing the test if none arrives in time.
pub async fn next_message<S>(ws: &mut S) -> Message
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(TEST_TIMEOUT, ws.next())
        .await
        .expect("no message in time")
        .expect("stream ended")
        .expect("read failed")
}

/// Read until the stream ends or fails, returning the messages seen on the way.
pub async fn drain_until_closed<S>(ws: &mut S) -> Vec<Message>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut received = Vec::new();
    loop {
        match tokio::time::timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("stream did not end in time")
        {
            Some(Ok(message)) => received.push(message),
            Some(Err(_)) | None => return received,
        }
    }
}
