use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::{GracefulShutdown, Watcher};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::oneshot;
use crate::commons::error::{Error, IoError};
use crate::config::Config;
use crate::constants::TOKENSIGN_SERVER_APP;
use super::http::server::HttpServer;
use super::http::tls;
use super::supervisor::SmartcardDaemon;


/// Runs the service until the process receives SIGINT or SIGTERM.
///
/// The smartcard daemon is started and the token probed before the
/// listener is bound. If any of that fails, an error is returned and no
/// request is ever accepted.
///
/// Once the listener is up, the bound address is sent through
/// `signal_running`.
pub async fn start_daemon(
    config: Arc<Config>,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
) -> Result<(), Error> {
    start_daemon_until(config, signal_running, shutdown_signal()).await
}

/// Runs the service until `shutdown` resolves.
///
/// On shutdown, no new connections are accepted. Requests in progress are
/// given up to `shutdown_grace_seconds` to finish before the smartcard
/// daemon is stopped.
pub async fn start_daemon_until(
    config: Arc<Config>,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let daemon = SmartcardDaemon::start(&config).await?;
    let res = serve(config, signal_running, shutdown).await;
    daemon.shutdown().await;
    res
}

/// Accepts connections until `shutdown` resolves, then drains them.
async fn serve(
    config: Arc<Config>,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let tls = if config.https_mode().is_disable_https() {
        None
    }
    else {
        match (&config.tls_cert_file, &config.tls_key_file) {
            (Some(cert), Some(key)) => Some(tls::create_acceptor(cert, key)?),
            _ => {
                return Err(Error::HttpsSetup(
                    "tls_cert_file and tls_key_file are required".into()
                ))
            }
        }
    };

    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        IoError::new(format!("Could not bind to {addr}"), err)
    })?;
    let addr = listener.local_addr().map_err(|err| {
        IoError::new("Cannot determine listener address", err)
    })?;
    info!(
        "{} listening on {}://{}",
        TOKENSIGN_SERVER_APP,
        if tls.is_some() { "https" } else { "http" },
        addr
    );

    if let Some(tx) = signal_running {
        let _ = tx.send(addr);
    }

    let server = Arc::new(HttpServer::new(config.clone()));
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        let stream = select! {
            _ = &mut shutdown => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    stream
                }
                Err(err) => {
                    // Running out of file descriptors and the like is
                    // temporary. Don’t spin on it though.
                    error!("Cannot accept connection on {}: {}", addr, err);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue
                }
            }
        };

        let server = server.clone();
        let tls = tls.clone();
        let watcher = graceful.watcher();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => {
                    match acceptor.accept(stream).await {
                        Ok(stream) => {
                            serve_connection(server, stream, watcher).await
                        }
                        Err(err) => debug!("TLS handshake failed: {}", err),
                    }
                }
                None => serve_connection(server, stream, watcher).await,
            }
        });
    }

    drop(listener);
    info!("Shutting down, waiting for requests in progress");
    select! {
        _ = graceful.shutdown() => {
            info!("All connections closed");
        }
        _ = tokio::time::sleep(config.shutdown_grace()) => {
            warn!(
                "Requests still running after {} seconds, abandoning them",
                config.shutdown_grace().as_secs()
            );
        }
    }
    Ok(())
}

/// Serves HTTP/1 or HTTP/2 on a single connection.
///
/// The connection is closed gracefully once `watcher` signals shutdown.
async fn serve_connection<S>(
    server: Arc<HttpServer>, stream: S, watcher: Watcher,
)
where S: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    let builder = hyper_util::server::conn::auto::Builder::new(
        TokioExecutor::new(),
    );
    let conn = builder.serve_connection(
        TokioIo::new(stream),
        service_fn(move |req| {
            let server = server.clone();
            async move { server.process_request(req).await }
        }),
    );
    if let Err(err) = watcher.watch(conn).await {
        debug!("Connection closed with error: {}", err);
    }
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                select! {
                    _ = tokio::signal::ctrl_c() => { }
                    _ = term.recv() => { }
                }
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
