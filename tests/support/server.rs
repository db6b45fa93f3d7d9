//! In-process backend servers for proxy tests.

use std::{convert::Infallible, future::Future, net::SocketAddr};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

pub struct Server {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The `host:port` authority the proxy config and metric labels use.
    pub fn authority(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns an HTTP/1.1 backend on an ephemeral port; `func` handles every
/// request. Assertions belong inside the handler.
#[allow(unused)]
pub async fn http<F, Fut>(func: F) -> Server
where
    F: Fn(http::Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<Full<Bytes>>> + Send + 'static,
{
    http_at("127.0.0.1:0".parse().expect("loopback addr"), func).await
}

/// Like [`http`], but binds at a caller-chosen address; used to bring a
/// backend up on a port the proxy is already trying to reach.
#[allow(unused)]
pub async fn http_at<F, Fut>(bind: SocketAddr, func: F) -> Server
where
    F: Fn(http::Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let Ok((io, _)) = accepted else { break };
                    let func = func.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let func = func.clone();
                            async move { Ok::<_, Infallible>(func(req).await) }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(io), service)
                            .await;
                    });
                }
            }
        }
    });

    Server {
        addr,
        shutdown_tx: Some(shutdown_tx),
    }
}

/// Spawns a TCP peer that accepts connections and immediately drops
/// them. The proxy's initial dial succeeds; the first dispatch on the
/// slot then surfaces the closed keep-alive connection.
#[allow(unused)]
pub async fn eof() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    drop(stream);
                }
            }
        }
    });

    Server {
        addr,
        shutdown_tx: Some(shutdown_tx),
    }
}

/// Spawns a TCP peer that reads whatever arrives and never answers,
/// pinning any dispatch that reaches it.
#[allow(unused)]
pub async fn stall() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    tokio::spawn(swallow(stream));
                }
            }
        }
    });

    Server {
        addr,
        shutdown_tx: Some(shutdown_tx),
    }
}

async fn swallow(mut stream: TcpStream) {
    let mut buf = [0u8; 4096];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}
