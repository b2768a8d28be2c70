//! The local HTTP ingress workloads call as a generic proxy.
//!
//! Each accepted connection is served on its own task. For every request
//! the ingress allocates a data channel, then runs the request writer
//! and the response reader concurrently — for large uploads the edge may
//! start responding before the body finishes, or only after it is
//! complete; either way both sides must make progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use http::{Method, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;

use super::channel::DataConn;
use super::pool::ChannelPool;
use crate::http1::conn::MessageReader;
use crate::http1::encode::{self, RequestBodySource};
use crate::http1::{BodyLength, RequestHead};
use crate::error::Error;

/// Responses may take a long time to produce; multipart uploads to the
/// object store are the slow extreme.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(600);

const SATURATED_BODY: &str = "Service Unavailable: All proxy channels in use";

/// Ingress observability counters; not protocol-visible.
#[derive(Debug, Default)]
pub struct IngressCounters {
    successful_requests: AtomicU64,
    service_unavailable_count: AtomicU64,
}

impl IngressCounters {
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    pub fn service_unavailable_count(&self) -> u64 {
        self.service_unavailable_count.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_unavailable(&self) {
        self.service_unavailable_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) async fn run_ingress(
    listener: TcpListener,
    pool: Arc<ChannelPool>,
    connected: watch::Receiver<bool>,
    counters: Arc<IngressCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "ingress connection accepted");
                    let pool = pool.clone();
                    let connected = connected.clone();
                    let counters = counters.clone();
                    tokio::spawn(serve_connection(stream, pool, connected, counters));
                }
                Err(err) => {
                    tracing::warn!(%err, "ingress accept failed");
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    pool: Arc<ChannelPool>,
    connected: watch::Receiver<bool>,
    counters: Arc<IngressCounters>,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = MessageReader::socket(read);

    loop {
        let head = match reader.read_request_head().await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(%err, "failed to parse ingress request");
                let _ = plain_response(
                    &mut write,
                    StatusCode::BAD_GATEWAY,
                    false,
                    &format!("Proxy Error: {}", err),
                )
                .await;
                return;
            }
        };

        // health endpoints answer locally, without touching the fabric
        if head.method == Method::GET
            && matches!(head.uri.path(), "/healthcheck" | "/health")
        {
            // drain any declared body so the connection stays parseable
            if reader.read_body(head.body).await.is_err() {
                return;
            }
            let body = if *connected.borrow() {
                "CONNECTED"
            } else {
                "DISCONNECTED"
            };
            if plain_response(&mut write, StatusCode::OK, false, body)
                .await
                .is_err()
            {
                return;
            }
            continue;
        }

        let head_request = head.method == Method::HEAD;
        match proxy_exchange(&mut reader, &head, &pool).await {
            Ok((status, headers, body)) => {
                counters.record_success();
                if let Err(err) =
                    encode::write_buffered_response(&mut write, status, &headers, &body, head_request)
                        .await
                {
                    tracing::debug!(%err, "failed to write ingress response");
                    return;
                }
            }
            Err(err) if err.is_saturated() || err.is_control_channel_down() => {
                counters.record_unavailable();
                tracing::warn!(%err, "rejecting ingress request: no channel available");
                let _ = plain_response(
                    &mut write,
                    StatusCode::SERVICE_UNAVAILABLE,
                    true,
                    SATURATED_BODY,
                )
                .await;
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "proxy exchange failed");
                let _ = plain_response(
                    &mut write,
                    StatusCode::BAD_GATEWAY,
                    false,
                    &format!("Proxy Error: {}", err),
                )
                .await;
                // the request body may be half-consumed; this
                // connection cannot carry another request
                return;
            }
        }
    }
}

/// One request/response round trip over an allocated data channel.
async fn proxy_exchange(
    reader: &mut MessageReader,
    head: &RequestHead,
    pool: &Arc<ChannelPool>,
) -> crate::Result<(StatusCode, HeaderMap, Bytes)> {
    let (lease, conn) = pool.allocate().await?;
    tracing::debug!(port = lease.port(), method = %head.method, path = %head.uri, "proxying request");

    let DataConn { write: mut chan_write, rx } = conn;
    let mut chan_reader = MessageReader::pipe(rx);
    let head_request = head.method == Method::HEAD;

    let body = match head.body {
        BodyLength::Empty | BodyLength::Known(0) => RequestBodySource::None,
        BodyLength::Known(_) => match reader.begin_body(head.body) {
            Some(decoder) => RequestBodySource::Sized(reader, decoder),
            None => RequestBodySource::None,
        },
        BodyLength::Chunked => match reader.begin_body(head.body) {
            Some(decoder) => RequestBodySource::Rechunk(reader, decoder),
            None => RequestBodySource::None,
        },
        // requests cannot be close-delimited
        BodyLength::CloseDelimited => return Err(Error::new_canceled()),
    };

    let write_fut = encode::write_request(
        &mut chan_write,
        &head.method,
        &head.uri,
        &head.headers,
        None,
        body,
    );
    let read_fut = async {
        match time::timeout(RESPONSE_TIMEOUT, chan_reader.read_response(head_request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new_response_timeout()),
        }
    };

    let ((), (response_head, response_body)) = tokio::try_join!(write_fut, read_fut)?;

    // keep-alive: the channel socket stays open and goes back to the pool
    match chan_reader.into_pipe() {
        Some(rx) => lease.checkin(DataConn {
            write: chan_write,
            rx,
        }),
        None => drop(lease),
    }

    Ok((response_head.status, response_head.headers, response_body))
}

async fn plain_response(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    status: StatusCode,
    retry_after: bool,
    body: &str,
) -> crate::Result<()> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1"));
    }
    if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
        headers.insert(CONTENT_LENGTH, len);
    }
    encode::write_unit(
        write,
        &encode::render_response_head(status, &headers),
    )
    .await?;
    encode::write_unit(write, body.as_bytes()).await
}
