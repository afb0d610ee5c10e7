use std::{
    error::Error,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{body::Body as AxumBody, response::IntoResponse};
use http::{
    HeaderMap, HeaderValue, Method, Uri,
    header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE},
};
use hyper::{Request, Response, StatusCode, body::Body};
use hyper_util::rt::TokioIo;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    addressing::{is_tunnel_host, split_host},
    connections::SessionRegistry,
    error::ServerError,
    files,
};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

// Hop-by-hop headers are stripped from both legs of the proxied exchange.
// The Upgrade pair is restored explicitly when a request asks for one.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Something that can open a fresh duplex channel into a tunneled client.
// Each HTTP request dials exactly once; channels are never pooled.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait TunnelDialer<T: Send + Sync + 'static> {
    async fn dial(&self, ip: IpAddr, port: u16) -> color_eyre::Result<T>;
}

// Everything the HTTP side needs to route a request: the registry for tunnel
// hosts and the data served on the apex landing surface.
pub(crate) struct ProxyData<H> {
    pub(crate) registry: Arc<SessionRegistry<Arc<H>>>,
    pub(crate) domain: String,
    pub(crate) ssh_host: String,
    pub(crate) public_key: String,
    pub(crate) request_timeout: Option<Duration>,
}

#[derive(Serialize)]
struct LandingConfig<'a> {
    url: String,
    ssh: SshEndpoint<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SshEndpoint<'a> {
    host: &'a str,
    public_key: &'a str,
}

// Routes one request: either serves the landing surface on the apex, or
// proxies a full HTTP exchange over a fresh channel into the matching tunnel.
pub(crate) async fn proxy_handler<B, H, T>(
    mut request: Request<B>,
    tcp_address: SocketAddr,
    proxy_data: Arc<ProxyData<H>>,
) -> color_eyre::Result<Response<AxumBody>>
where
    H: TunnelDialer<T> + Send + Sync,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    B: Body + Send + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    let timer = Instant::now();
    let host = request
        .headers()
        .get(HOST)
        .ok_or(ServerError::MissingHost)?
        .to_str()
        .map_err(|_| ServerError::InvalidHost)?;
    let host = split_host(host).to_owned();
    if !is_tunnel_host(&host, &proxy_data.domain) {
        return Ok(landing_handler(&request, &proxy_data));
    }

    let method = request.method().to_string();
    let uri = request.uri().to_string();
    let Some(dialer) = proxy_data.registry.lookup(&host) else {
        info!(%host, "No tunnel registered for host.");
        http_log(StatusCode::NOT_FOUND, &method, &host, &uri, timer.elapsed());
        return Ok((StatusCode::NOT_FOUND, "").into_response());
    };

    // Best-effort HTTP/1.1 shape for the tunneled request: strip hop-by-hop
    // headers (restoring the Upgrade pair when requested), reduce the URI to
    // path and query, and keep the original Host header.
    let request_upgrade = request.headers().get(UPGRADE).cloned();
    strip_hop_by_hop_headers(request.headers_mut());
    if let Some(ref upgrade) = request_upgrade {
        request
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        request.headers_mut().insert(UPGRADE, upgrade.clone());
    }
    let headers = request.headers_mut();
    append_to_header(headers, X_FORWARDED_FOR, &tcp_address.ip().to_string());
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    *request.uri_mut() = request
        .uri()
        .path_and_query()
        .and_then(|path| Uri::from_str(path.as_str()).ok())
        .unwrap_or_default();

    let io = match dialer.dial(tcp_address.ip(), tcp_address.port()).await {
        Ok(io) => io,
        Err(error) => {
            info!(%error, %host, "Failed to open tunneling channel.");
            http_log(StatusCode::BAD_GATEWAY, &method, &host, &uri, timer.elapsed());
            return Ok((StatusCode::BAD_GATEWAY, "").into_response());
        }
    };
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(io)).await {
        Ok(handshake) => handshake,
        Err(error) => {
            info!(%error, %host, "HTTP handshake with tunneled service failed.");
            http_log(StatusCode::BAD_GATEWAY, &method, &host, &uri, timer.elapsed());
            return Ok((StatusCode::BAD_GATEWAY, "").into_response());
        }
    };

    match request_upgrade {
        None => {
            tokio::spawn(async move {
                if let Err(error) = conn.await {
                    debug!(%error, "Tunneled connection failed.");
                }
            });
            let result = match proxy_data.request_timeout {
                Some(duration) => match timeout(duration, sender.send_request(request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        http_log(
                            StatusCode::GATEWAY_TIMEOUT,
                            &method,
                            &host,
                            &uri,
                            timer.elapsed(),
                        );
                        return Ok((StatusCode::GATEWAY_TIMEOUT, "").into_response());
                    }
                },
                None => sender.send_request(request).await,
            };
            let mut response = match result {
                Ok(response) => response,
                Err(error) => {
                    info!(%error, %host, "Tunneled request failed.");
                    http_log(StatusCode::BAD_GATEWAY, &method, &host, &uri, timer.elapsed());
                    return Ok((StatusCode::BAD_GATEWAY, "").into_response());
                }
            };
            strip_hop_by_hop_headers(response.headers_mut());
            http_log(response.status(), &method, &host, &uri, timer.elapsed());
            Ok(response.into_response())
        }
        Some(request_upgrade) => {
            tokio::spawn(async move {
                if let Err(error) = conn.with_upgrades().await {
                    debug!(%error, "Tunneled connection failed.");
                }
            });
            let request_type = request_upgrade
                .to_str()
                .map_err(|_| ServerError::InvalidUpgrade)?
                .to_string();
            let upgraded_request = hyper::upgrade::on(&mut request);
            let result = match proxy_data.request_timeout {
                Some(duration) => match timeout(duration, sender.send_request(request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        http_log(
                            StatusCode::GATEWAY_TIMEOUT,
                            &method,
                            &host,
                            &uri,
                            timer.elapsed(),
                        );
                        return Ok((StatusCode::GATEWAY_TIMEOUT, "").into_response());
                    }
                },
                None => sender.send_request(request).await,
            };
            let mut response = match result {
                Ok(response) => response,
                Err(error) => {
                    info!(%error, %host, "Tunneled request failed.");
                    http_log(StatusCode::BAD_GATEWAY, &method, &host, &uri, timer.elapsed());
                    return Ok((StatusCode::BAD_GATEWAY, "").into_response());
                }
            };
            http_log(response.status(), &method, &host, &uri, timer.elapsed());
            match response.status() {
                StatusCode::SWITCHING_PROTOCOLS => {
                    if request_type
                        == response
                            .headers()
                            .get(UPGRADE)
                            .ok_or(ServerError::InvalidUpgrade)?
                            .to_str()
                            .map_err(|_| ServerError::InvalidUpgrade)?
                    {
                        let upgraded_response = hyper::upgrade::on(&mut response).await?;
                        tokio::spawn(async move {
                            let Ok(upgraded_request) = upgraded_request.await else {
                                return;
                            };
                            let mut upgraded_request = TokioIo::new(upgraded_request);
                            let mut upgraded_response = TokioIo::new(upgraded_response);
                            let _ =
                                copy_bidirectional(&mut upgraded_response, &mut upgraded_request)
                                    .await;
                        });
                    }
                    Ok(response.into_response())
                }
                _ => {
                    strip_hop_by_hop_headers(response.headers_mut());
                    Ok(response.into_response())
                }
            }
        }
    }
}

// Apex surface: the configuration document and the embedded landing assets.
fn landing_handler<B, H>(request: &Request<B>, proxy_data: &ProxyData<H>) -> Response<AxumBody> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/config") => {
            let config = LandingConfig {
                url: format!("https://{}", proxy_data.domain),
                ssh: SshEndpoint {
                    host: &proxy_data.ssh_host,
                    public_key: &proxy_data.public_key,
                },
            };
            let body = serde_json::to_string(&config).expect("config document serializes");
            (
                StatusCode::OK,
                [(CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        (&Method::GET, path) => match files::get(path) {
            Some(asset) => (
                StatusCode::OK,
                [(CONTENT_TYPE, asset.content_type)],
                asset.body,
            )
                .into_response(),
            None => (StatusCode::NOT_FOUND, "").into_response(),
        },
        _ => (StatusCode::METHOD_NOT_ALLOWED, "").into_response(),
    }
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    for header in HOP_BY_HOP_HEADERS {
        headers.remove(header);
    }
}

fn append_to_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match headers.entry(name) {
        http::header::Entry::Occupied(mut entry) => {
            let mut joined = entry.get().as_bytes().to_vec();
            joined.extend_from_slice(b", ");
            joined.extend_from_slice(value.as_bytes());
            if let Ok(joined) = HeaderValue::from_bytes(&joined) {
                entry.insert(joined);
            }
        }
        http::header::Entry::Vacant(entry) => {
            if let Ok(value) = HeaderValue::from_str(value) {
                entry.insert(value);
            }
        }
    }
}

fn http_log(status: StatusCode, method: &str, host: &str, uri: &str, elapsed: Duration) {
    info!(
        status = status.as_u16(),
        method, host, uri, ?elapsed, "Handled HTTP request."
    );
}
