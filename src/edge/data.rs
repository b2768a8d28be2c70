//! Edge-side data-channel service loop.
//!
//! One loop per accepted allocation: parse a request off the channel,
//! synthesize the HTTPS target from the Host header, hand it to the
//! store adapter, serialize the response back, and keep the connection
//! for the next request. Exits cleanly when the container side closes
//! the socket.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST};
use http::{Method, StatusCode};
use tokio::net::TcpStream;
use url::Url;

use crate::http1::conn::MessageReader;
use crate::http1::encode;
use crate::store::adapter::StoreAdapter;

pub(crate) async fn serve_data_channel(
    adapter: Arc<StoreAdapter>,
    stream: TcpStream,
) -> crate::Result<()> {
    let peer = stream.peer_addr().map_err(crate::Error::new_io)?;
    let (read, mut write) = stream.into_split();
    let mut reader = MessageReader::socket(read);

    loop {
        let (head, body) = match reader.read_request().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(%peer, "data channel closed by peer");
                return Ok(());
            }
            Err(err) => {
                // best effort: tell the peer before tearing down
                let _ = write_proxy_error(&mut write, &format!("{}", err)).await;
                return Err(err);
            }
        };

        // The backend is HTTPS-only; the scheme is forced no matter
        // what the tunneled request asked for.
        let host = head
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("localhost");
        let target = head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = match Url::parse(&format!("https://{}{}", host, target)) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(%err, host, target, "unbuildable target url");
                write_proxy_error(&mut write, "invalid request target").await?;
                continue;
            }
        };

        tracing::debug!(method = %head.method, %url, body_len = body.len(), "serving tunneled request");
        let head_request = head.method == Method::HEAD;
        let response = adapter.handle(&head.method, &url, &head.headers, body).await;

        encode::write_response(
            &mut write,
            response.status(),
            response.headers(),
            response.body(),
            head_request,
        )
        .await?;
    }
}

async fn write_proxy_error(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    detail: &str,
) -> crate::Result<()> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    let body = Bytes::from(format!("Proxy Error: {}", detail));
    encode::write_response(write, StatusCode::BAD_GATEWAY, &headers, &body, false).await
}
