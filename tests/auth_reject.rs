use std::time::Duration;

use clap::Parser;
use http::{StatusCode, header::HOST};
use hyper::Request;
use hyper_util::rt::TokioIo;
use porthole::{ApplicationConfig, entrypoint};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

/// With a password configured, `none` authentication and wrong passwords are
/// rejected, and no tunnel ever appears for the would-be subdomain.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auth_reject() {
    // 1. Initialize porthole
    let config = ApplicationConfig::parse_from([
        "porthole",
        "--domain=example.test",
        "--password=s3cret",
        "--private-key-file",
        &format!(
            "{}/tests/data/server_keys/ssh",
            std::env::var("CARGO_MANIFEST_DIR").unwrap()
        ),
        "--listen-address=127.0.0.1",
        "--ssh-port=18222",
        "--http-port=18280",
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18222").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for porthole to start.")
    };

    // 2. Before any client connects, tunnel hosts answer 404
    assert_eq!(
        get_status("a.example.test", "/").await,
        StatusCode::NOT_FOUND
    );

    // 3. `none` authentication is rejected
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18222", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        !session
            .authenticate_none("user")
            .await
            .expect("SSH authentication request failed")
            .success(),
        "none authentication should have been rejected"
    );

    // 4. A wrong password is rejected
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18222", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        !session
            .authenticate_password("user", "wrong")
            .await
            .expect("SSH authentication request failed")
            .success(),
        "wrong password should have been rejected"
    );

    // 5. Still no tunnel registered
    assert_eq!(
        get_status("a.example.test", "/").await,
        StatusCode::NOT_FOUND
    );
}

async fn get_status(host: &str, path: &str) -> StatusCode {
    let tcp_stream = TcpStream::connect("127.0.0.1:18280")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp_stream))
        .await
        .expect("HTTP handshake failed");
    let jh = tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, host)
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for request to finish.")
        .expect("Error sending HTTP request");
    jh.abort();
    response.status()
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
}
