use std::time::Duration;

use axum::{Router, routing::get};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use clap::Parser;
use http::{StatusCode, header::HOST};
use http_body_util::BodyExt;
use hyper::{Request, Response, body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use porthole::{ApplicationConfig, entrypoint};
use russh::{
    Channel,
    client::{Msg, Session},
    keys::load_secret_key,
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tower::Service;

/// Requests to the apex serve the landing surface: the configuration
/// document, the embedded assets, 404 on unknown paths, and 405 on non-GET
/// methods. With no password configured, `none` authentication is accepted
/// and tunnels work.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn landing_config() {
    // 1. Initialize porthole without a password
    let key_path = format!(
        "{}/tests/data/server_keys/ssh",
        std::env::var("CARGO_MANIFEST_DIR").unwrap()
    );
    let config = ApplicationConfig::parse_from([
        "porthole",
        "--domain=example.test",
        "--private-key-file",
        &key_path,
        "--listen-address=127.0.0.1",
        "--ssh-port=18322",
        "--http-port=18380",
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18322").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for porthole to start.")
    };

    // 2. The config document describes the public URL and SSH endpoint
    let response = request("GET", "example.test", "/config").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Error collecting response")
        .to_bytes();
    let config_document: serde_json::Value =
        serde_json::from_slice(&body).expect("Invalid JSON in config document");
    assert_eq!(config_document["url"], "https://example.test");
    assert_eq!(config_document["ssh"]["host"], "example.test:18322");
    let key = load_secret_key(&key_path, None).expect("Missing test host key");
    let expected_public_key = BASE64_STANDARD.encode(
        key.public_key()
            .to_bytes()
            .expect("Failed to encode public key"),
    );
    assert_eq!(config_document["ssh"]["publicKey"], expected_public_key);

    // 3. Static assets: index for the root, 404 on miss, 405 on non-GET
    let response = request("GET", "example.test", "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8(body.into()).unwrap().contains("porthole"));
    let response = request("GET", "example.test", "/missing.html").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = request("POST", "example.test", "/").await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    // 4. Without a password, `none` authentication is enough to tunnel
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18322", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_none("user")
            .await
            .expect("SSH authentication request failed")
            .success(),
        "none authentication should have been accepted"
    );
    session
        .tcpip_forward("open", 80)
        .await
        .expect("tcpip_forward failed");
    let response = request("GET", "open.example.test", "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, bytes::Bytes::from("tunneled"));
}

async fn request(method: &str, host: &str, path: &str) -> Response<Incoming> {
    let tcp_stream = TcpStream::connect("127.0.0.1:18380")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp_stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, host)
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .unwrap();
    timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for request to finish.")
        .expect("Error sending HTTP request")
}

struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let router = Router::new()
            .route("/", get(async || "tunneled"))
            .into_service();
        let service = service_fn(move |req: Request<Incoming>| router.clone().call(req));
        tokio::spawn(async move {
            let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(channel.into_stream()), service)
                .await;
        });
        Ok(())
    }
}
