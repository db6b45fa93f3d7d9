//! Listening servers.
//!
//! Every configured listener binds its own TCP socket (optionally
//! terminating TLS) and serves accepted connections with the HTTP/1.1
//! protocol stack, handing each request to the shared [`Dispatcher`].
//! Binding failures are fatal at startup; accept failures are logged and
//! survived.

use std::convert::Infallible;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

/// The set of bound listeners plus the dispatcher they feed.
#[derive(Debug)]
pub struct Server {
    listeners: Vec<Bound>,
    dispatcher: Dispatcher,
}

struct Bound {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    addr: SocketAddr,
}

impl std::fmt::Debug for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Bound")
            .field("addr", &self.addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Server {
    /// Binds every configured listener.
    ///
    /// Any bind failure or unreadable TLS material aborts startup; a
    /// proxy silently missing one of its ports would be worse than one
    /// that refuses to start.
    pub async fn bind(config: &Config, dispatcher: Dispatcher) -> Result<Server> {
        let mut listeners = Vec::with_capacity(config.listeners.len());

        for listener in &config.listeners {
            let bind_addr = SocketAddr::from(([0, 0, 0, 0], listener.port));
            let socket = TcpListener::bind(bind_addr).await.map_err(Error::config)?;
            let addr = socket.local_addr().map_err(Error::config)?;

            let tls = match (&listener.tls_cert, &listener.tls_key) {
                (Some(cert), Some(key)) => Some(load_tls(cert, key)?),
                _ => None,
            };

            log::info!(
                "listening on {addr}{}",
                if tls.is_some() { " (tls)" } else { "" }
            );
            listeners.push(Bound {
                listener: socket,
                tls,
                addr,
            });
        }

        Ok(Server {
            listeners,
            dispatcher,
        })
    }

    /// The addresses actually bound, in configuration order.
    ///
    /// Differs from the configured ports when a listener asked for port
    /// 0 and the operating system picked one.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|bound| bound.addr).collect()
    }

    /// Serves every listener until `shutdown` resolves, then stops
    /// accepting and returns.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut accept_loops = Vec::with_capacity(self.listeners.len());

        for bound in self.listeners {
            let dispatcher = self.dispatcher.clone();
            let mut stop = stop_rx.clone();

            accept_loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        accepted = bound.listener.accept() => {
                            match accepted {
                                Ok((stream, remote)) => {
                                    let tls = bound.tls.clone();
                                    let dispatcher = dispatcher.clone();
                                    tokio::spawn(async move {
                                        serve_connection(stream, remote, tls, dispatcher).await;
                                    });
                                }
                                Err(e) => {
                                    log::warn!("accepting on {} failed: {e}", bound.addr);
                                }
                            }
                        }
                    }
                }
            }));
        }

        shutdown.await;
        let _ = stop_tx.send(true);
        for accept_loop in accept_loops {
            let _ = accept_loop.await;
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    tls: Option<TlsAcceptor>,
    dispatcher: Dispatcher,
) {
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.handle(req, remote).await) }
    });

    let result = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                http1::Builder::new()
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
            }
            Err(e) => {
                log::debug!("tls handshake with {remote} failed: {e}");
                return;
            }
        },
        None => {
            http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
        }
    };

    if let Err(e) = result {
        log::debug!("connection from {remote} ended: {e}");
    }
}

fn load_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let mut reader = BufReader::new(File::open(cert_path).map_err(Error::config)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<_>>()
        .map_err(Error::config)?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut reader = BufReader::new(File::open(key_path).map_err(Error::config)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(Error::config)?
        .ok_or_else(|| {
            Error::config(format!("no private key found in {}", key_path.display()))
        })?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::config)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
