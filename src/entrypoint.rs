use std::{net::SocketAddr, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use color_eyre::eyre::Context;
use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use russh::keys::decode_secret_key;
use tokio::{
    fs,
    net::{TcpListener, TcpStream},
    pin,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    PortholeServer,
    config::ApplicationConfig,
    connections::SessionRegistry,
    http::{ProxyData, proxy_handler},
    ssh::Server,
};

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting porthole...");
    // Load the host key; this is the one piece of state that must exist
    // before anything listens.
    let key = fs::read_to_string(config.private_key_file.as_path())
        .await
        .with_context(|| {
            format!(
                "Error reading host key file {}",
                config.private_key_file.display()
            )
        })?;
    let key = decode_secret_key(&key, None).with_context(|| "Error decoding host key")?;
    let public_key = BASE64_STANDARD.encode(
        key.public_key()
            .to_bytes()
            .with_context(|| "Error encoding host public key")?,
    );

    let ssh_config = Arc::new(russh::server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![key],
        ..Default::default()
    });

    let registry = Arc::new(SessionRegistry::new());
    let mut server = Arc::new(PortholeServer {
        registry: Arc::clone(&registry),
        password: Some(config.password).filter(|password| !password.is_empty()),
    });
    let proxy_data = Arc::new(ProxyData {
        registry,
        domain: config.domain.clone(),
        ssh_host: format!("{}:{}", config.domain, config.ssh_port),
        public_key,
        request_timeout: config.http_request_timeout,
    });

    let http_listener = TcpListener::bind((config.listen_address.clone(), config.http_port))
        .await
        .with_context(|| "Error listening to HTTP port and address")?;
    let ssh_listener = TcpListener::bind((config.listen_address.clone(), config.ssh_port))
        .await
        .with_context(|| "Error listening to SSH port and address")?;
    info!(
        domain = %config.domain,
        ssh_port = config.ssh_port,
        http_port = config.http_port,
        "porthole is now running."
    );

    // In-flight HTTP connections, so shutdown can give them a drain period.
    let connection_tracker = TaskTracker::new();
    let shutdown_token = CancellationToken::new();

    let tracker = connection_tracker.clone();
    let mut join_handle_http = tokio::spawn(async move {
        loop {
            let (stream, address) = match http_listener.accept().await {
                Ok(conn) => conn,
                Err(error) => {
                    error!(%error, "Unable to accept HTTP connection.");
                    break;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%error, %address, "Error setting nodelay.");
            }
            let proxy_data = Arc::clone(&proxy_data);
            tracker.spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    proxy_handler(request, address, Arc::clone(&proxy_data))
                });
                let io = TokioIo::new(stream);
                let conn = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                let _ = conn.await;
            });
        }
    });

    // Add OS signal handlers for termination.
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            conn = ssh_listener.accept() => {
                let (stream, address) = match conn {
                    Ok(conn) => conn,
                    Err(error) => {
                        error!(%error, "Unable to accept SSH connection.");
                        break;
                    }
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, %address, "Error setting nodelay.");
                }
                handle_ssh_connection(
                    stream,
                    address,
                    Arc::clone(&ssh_config),
                    &mut server,
                    shutdown_token.child_token(),
                );
            }
            _ = &mut signal_handler => {
                break;
            }
            _ = &mut join_handle_http => {
                break;
            }
        }
    }

    info!("porthole is shutting down.");
    // Stop accepting, disconnect SSH clients, and give in-flight HTTP
    // connections a bounded period to drain.
    join_handle_http.abort();
    shutdown_token.cancel();
    connection_tracker.close();
    if timeout(config.graceful_shutdown_timeout, connection_tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown grace period expired with connections still in flight.");
    }
    Ok(())
}

fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<russh::server::Config>,
    server: &mut Arc<PortholeServer>,
    cancellation_token: CancellationToken,
) {
    // Create a new SSH handler.
    let handler = server.new_client(address);
    tokio::spawn(async move {
        let mut session = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => session,
            Err(error) => {
                debug!(%error, %address, "SSH connection setup failed.");
                return;
            }
        };
        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    debug!(%error, %address, "SSH connection closed.");
                }
            }
            _ = cancellation_token.cancelled() => {
                info!(%address, "Disconnecting SSH client...");
                let _ = session
                    .handle()
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
