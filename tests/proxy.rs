//! End-to-end exercises of the proxy fabric over real sockets: a bound
//! container side, a supervised edge side, and raw TCP clients against
//! the ingress.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use warren::config::Config;
use warren::container::{ContainerHandle, ContainerSide};
use warren::edge::{ContainerStatus, EdgeConfig, EdgeSide};
use warren::store::adapter::StoreAdapter;
use warren::store::memory::MemoryStore;
use warren::store::{
    CompletedPart, ListOptions, ListResult, ObjectBody, ObjectMeta, ObjectStore, PutOptions,
    StoreError,
};

static NEXT_PORT_BLOCK: AtomicU16 = AtomicU16::new(0);

/// Picks a candidate base port for one control + N data listeners.
fn candidate_base(channels: u16) -> u16 {
    let block = NEXT_PORT_BLOCK.fetch_add(1, Ordering::Relaxed);
    let seed = (process::id() as u16).wrapping_mul(29);
    21000 + ((seed.wrapping_add(block.wrapping_mul(channels + 7))) % 30000)
}

async fn bind_container(channels: u16) -> (ContainerSide, Config) {
    for _ in 0..64 {
        let base = candidate_base(channels);
        let config = Config {
            ingress_port: 0,
            control_port: base,
            data_port_base: base + 1,
            data_channels: channels,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            container_host: "127.0.0.1".to_owned(),
            default_bucket: "default".to_owned(),
            buckets: vec!["bucketA".to_owned()],
        };
        if let Ok(container) = ContainerSide::bind(&config).await {
            return (container, config);
        }
    }
    panic!("could not find a free contiguous port run");
}

fn make_edge<S: ObjectStore>(config: &Config, store: Arc<S>) -> (Arc<EdgeSide>, watch::Sender<ContainerStatus>) {
    let adapter = StoreAdapter::new(
        store,
        config.default_bucket.clone(),
        config.buckets.clone(),
    );
    let (status_tx, status_rx) = watch::channel(ContainerStatus::Running);
    let edge = Arc::new(EdgeSide::new(
        EdgeConfig::from_config(config),
        adapter,
        status_rx,
    ));
    (edge, status_tx)
}

async fn wait_connected(handle: &ContainerHandle, want: bool) {
    let mut rx = handle.connected_watch();
    timeout(Duration::from_secs(30), async {
        while *rx.borrow() != want {
            rx.changed().await.expect("connection watch closed");
        }
    })
    .await
    .expect("timed out waiting for control channel state");
}

struct Fabric {
    handle: ContainerHandle,
    ingress: SocketAddr,
    store: Arc<MemoryStore>,
    _edge: Arc<EdgeSide>,
    _status_tx: watch::Sender<ContainerStatus>,
}

/// Container + edge, connected and ready.
async fn start_fabric(channels: u16) -> Fabric {
    let (container, config) = bind_container(channels).await;
    let handle = container.handle();
    let ingress = container.ingress_addr();
    tokio::spawn(container.run());

    let store = Arc::new(MemoryStore::new(["default", "bucketA"]));
    let (edge, status_tx) = make_edge(&config, store.clone());
    edge.spawn_supervisor();
    wait_connected(&handle, true).await;

    Fabric {
        handle,
        ingress,
        store,
        _edge: edge,
        _status_tx: status_tx,
    }
}

/// Sends raw bytes to the ingress and reads exactly one response.
async fn roundtrip(addr: SocketAddr, raw: &[u8]) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.expect("connect ingress");
    stream.write_all(raw).await.expect("write request");
    read_one_response(&mut stream).await
}

async fn read_one_response(stream: &mut TcpStream) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 16 * 1024];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).await.expect("read response");
        assert!(n > 0, "eof before response head: {:?}", String::from_utf8_lossy(&buf));
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = std::str::from_utf8(&buf[..header_end]).expect("ascii head");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse().expect("content-length"))
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await.expect("read body");
        assert!(n > 0, "eof mid-body");
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);
    (status, headers, body)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[tokio::test]
async fn healthcheck_reports_connection_state() {
    let (container, config) = bind_container(2).await;
    let handle = container.handle();
    let ingress = container.ingress_addr();
    tokio::spawn(container.run());

    // before the edge connects
    let (status, _, body) = roundtrip(ingress, b"GET /healthcheck HTTP/1.1\r\nhost: h\r\n\r\n").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"DISCONNECTED");

    let store = Arc::new(MemoryStore::new(["default", "bucketA"]));
    let (edge, _status_tx) = make_edge(&config, store);
    edge.spawn_supervisor();
    wait_connected(&handle, true).await;

    let (status, _, body) = roundtrip(ingress, b"GET /health HTTP/1.1\r\nhost: h\r\n\r\n").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"CONNECTED");
}

#[tokio::test]
async fn get_of_seeded_object_carries_metadata() {
    let fabric = start_fabric(2).await;
    fabric
        .store
        .put(
            "bucketA",
            "hello.txt",
            Bytes::from_static(b"hi\n"),
            PutOptions {
                content_type: Some("text/plain".to_owned()),
                md5: None,
            },
        )
        .await
        .unwrap();

    let (status, headers, body) = roundtrip(
        fabric.ingress,
        b"GET /bucketA/hello.txt HTTP/1.1\r\nhost: store\r\n\r\n",
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hi\n");
    assert_eq!(headers["content-length"], "3");
    assert_eq!(headers["content-type"], "text/plain");
    assert!(headers["etag"].starts_with('"'));
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(fabric.handle.counters().successful_requests(), 1);
}

#[tokio::test]
async fn put_with_content_length_round_trips() {
    let fabric = start_fabric(2).await;
    let payload = b"some object bytes";
    let mut request = format!(
        "PUT /bucketA/obj HTTP/1.1\r\nhost: store\r\ncontent-length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    request.extend_from_slice(payload);

    let (status, headers, _) = roundtrip(fabric.ingress, &request).await;
    assert_eq!(status, 204);
    assert!(headers.contains_key("etag"));

    let stored = fabric.store.get("bucketA", "obj").await.unwrap();
    assert_eq!(&stored.data[..], payload);
}

#[tokio::test]
async fn chunked_put_is_delivered_length_framed() {
    let fabric = start_fabric(2).await;
    let request = b"PUT /bucketA/k HTTP/1.1\r\n\
        host: store\r\n\
        transfer-encoding: chunked\r\n\
        \r\n\
        5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

    let (status, _, _) = roundtrip(fabric.ingress, request).await;
    assert_eq!(status, 204);

    let stored = fabric.store.get("bucketA", "k").await.unwrap();
    assert_eq!(&stored.data[..], b"hello world");
    assert_eq!(stored.meta.content_length, 11);
}

#[tokio::test]
async fn keep_alive_carries_sequential_requests() {
    let fabric = start_fabric(1).await;
    fabric
        .store
        .put("bucketA", "a", Bytes::from_static(b"one"), PutOptions::default())
        .await
        .unwrap();
    fabric
        .store
        .put("bucketA", "b", Bytes::from_static(b"two"), PutOptions::default())
        .await
        .unwrap();

    // one ingress connection, one data channel, two exchanges
    let mut stream = TcpStream::connect(fabric.ingress).await.unwrap();
    stream
        .write_all(b"GET /bucketA/a HTTP/1.1\r\nhost: s\r\n\r\n")
        .await
        .unwrap();
    let (status, _, body) = read_one_response(&mut stream).await;
    assert_eq!((status, body.as_slice()), (200, &b"one"[..]));

    stream
        .write_all(b"GET /bucketA/b HTTP/1.1\r\nhost: s\r\n\r\n")
        .await
        .unwrap();
    let (status, _, body) = read_one_response(&mut stream).await;
    assert_eq!((status, body.as_slice()), (200, &b"two"[..]));
}

#[tokio::test]
async fn head_request_returns_metadata_without_body() {
    let fabric = start_fabric(2).await;
    fabric
        .store
        .put("bucketA", "h", Bytes::from_static(b"12345"), PutOptions::default())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(fabric.ingress).await.unwrap();
    stream
        .write_all(b"HEAD /bucketA/h HTTP/1.1\r\nhost: s\r\n\r\n")
        .await
        .unwrap();

    // read the head only; no body bytes may follow
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "eof before head response");
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = std::str::from_utf8(&buf[..header_end]).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("content-length: 5\r\n"));
    assert_eq!(buf.len(), header_end + 4, "HEAD response carried body bytes");

    // the connection stays aligned: a GET on the same socket works
    stream
        .write_all(b"GET /bucketA/h HTTP/1.1\r\nhost: s\r\n\r\n")
        .await
        .unwrap();
    let (status, _, body) = read_one_response(&mut stream).await;
    assert_eq!((status, body.as_slice()), (200, &b"12345"[..]));
}

#[tokio::test]
async fn missing_object_forwards_the_xml_error() {
    let fabric = start_fabric(2).await;
    let (status, _, body) = roundtrip(
        fabric.ingress,
        b"GET /bucketA/absent HTTP/1.1\r\nhost: store\r\n\r\n",
    )
    .await;
    assert_eq!(status, 404);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("<Code>NoSuchKey</Code>"), "{}", text);
}

/// An object store whose reads block until the gate opens; used to hold
/// data channels busy.
struct GatedStore {
    inner: MemoryStore,
    gate: watch::Receiver<bool>,
}

#[async_trait::async_trait]
impl ObjectStore for GatedStore {
    async fn list(&self, b: &str, o: ListOptions) -> Result<ListResult, StoreError> {
        self.inner.list(b, o).await
    }
    async fn get(&self, b: &str, k: &str) -> Result<ObjectBody, StoreError> {
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            gate.changed()
                .await
                .map_err(|_| StoreError::Internal("gate dropped".to_owned()))?;
        }
        self.inner.get(b, k).await
    }
    async fn head(&self, b: &str, k: &str) -> Result<ObjectMeta, StoreError> {
        self.inner.head(b, k).await
    }
    async fn put(&self, b: &str, k: &str, d: Bytes, o: PutOptions) -> Result<String, StoreError> {
        self.inner.put(b, k, d, o).await
    }
    async fn delete(&self, b: &str, k: &str) -> Result<(), StoreError> {
        self.inner.delete(b, k).await
    }
    async fn create_multipart(
        &self,
        b: &str,
        k: &str,
        o: PutOptions,
    ) -> Result<String, StoreError> {
        self.inner.create_multipart(b, k, o).await
    }
    async fn upload_part(
        &self,
        b: &str,
        k: &str,
        id: &str,
        n: u32,
        d: Bytes,
    ) -> Result<String, StoreError> {
        self.inner.upload_part(b, k, id, n, d).await
    }
    async fn complete_multipart(
        &self,
        b: &str,
        k: &str,
        id: &str,
        p: Vec<CompletedPart>,
    ) -> Result<String, StoreError> {
        self.inner.complete_multipart(b, k, id, p).await
    }
    async fn abort_multipart(&self, b: &str, k: &str, id: &str) -> Result<(), StoreError> {
        self.inner.abort_multipart(b, k, id).await
    }
}

#[tokio::test]
async fn saturating_every_channel_rejects_the_next_request() {
    let channels = 2u16;
    let (container, config) = bind_container(channels).await;
    let handle = container.handle();
    let ingress = container.ingress_addr();
    tokio::spawn(container.run());

    let (gate_tx, gate_rx) = watch::channel(false);
    let inner = MemoryStore::new(["default", "bucketA"]);
    inner
        .put("bucketA", "slow", Bytes::from_static(b"held"), PutOptions::default())
        .await
        .unwrap();
    let store = Arc::new(GatedStore {
        inner,
        gate: gate_rx,
    });
    let (edge, _status_tx) = make_edge(&config, store);
    edge.spawn_supervisor();
    wait_connected(&handle, true).await;

    // occupy every channel with gated reads
    let mut held = Vec::new();
    for _ in 0..channels {
        held.push(tokio::spawn(roundtrip(
            ingress,
            b"GET /bucketA/slow HTTP/1.1\r\nhost: s\r\n\r\n",
        )));
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    // the (N+1)th request is turned away immediately
    let (status, headers, body) = roundtrip(
        ingress,
        b"GET /bucketA/slow HTTP/1.1\r\nhost: s\r\n\r\n",
    )
    .await;
    assert_eq!(status, 503);
    assert_eq!(headers["retry-after"], "1");
    assert_eq!(body, b"Service Unavailable: All proxy channels in use");
    assert_eq!(handle.counters().service_unavailable_count(), 1);

    // release the gate: the held requests finish, and a retry succeeds
    gate_tx.send(true).unwrap();
    for task in held {
        let (status, _, body) = task.await.unwrap();
        assert_eq!((status, body.as_slice()), (200, &b"held"[..]));
    }
    let (status, _, _) = roundtrip(
        ingress,
        b"GET /bucketA/slow HTTP/1.1\r\nhost: s\r\n\r\n",
    )
    .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn oversized_put_multiparts_and_reads_back_identical() {
    let fabric = start_fabric(2).await;

    // 60 MB: over the single-shot limit, six 10 MiB parts
    let len = 60_000_000usize;
    let mut payload = vec![0u8; len];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    let mut request = format!(
        "PUT /bucketA/large HTTP/1.1\r\nhost: store\r\ncontent-length: {}\r\n\r\n",
        len
    )
    .into_bytes();
    request.extend_from_slice(&payload);

    let (status, headers, _) = roundtrip(fabric.ingress, &request).await;
    assert_eq!(status, 204);
    assert!(headers["etag"].contains('-'), "multipart etag expected");

    let meta = fabric.store.head("bucketA", "large").await.unwrap();
    assert_eq!(meta.content_length, len as u64);
    assert!(meta.etag.ends_with("-6"));

    let (status, _, body) = roundtrip(
        fabric.ingress,
        b"GET /bucketA/large HTTP/1.1\r\nhost: store\r\n\r\n",
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.len(), len);
    assert_eq!(body, payload);
}

#[tokio::test]
async fn edge_restart_fails_inflight_then_recovers() {
    let channels = 2u16;
    let (container, config) = bind_container(channels).await;
    let handle = container.handle();
    let ingress = container.ingress_addr();
    tokio::spawn(container.run());

    // first edge lives on its own runtime so it can be killed abruptly
    let (gate_tx, gate_rx) = watch::channel(false);
    let inner = MemoryStore::new(["default", "bucketA"]);
    inner
        .put("bucketA", "k", Bytes::from_static(b"v"), PutOptions::default())
        .await
        .unwrap();
    let store = Arc::new(GatedStore {
        inner,
        gate: gate_rx,
    });
    let (edge, _status_tx) = make_edge(&config, store);
    let rt = tokio::runtime::Runtime::new().unwrap();
    {
        let edge = edge.clone();
        rt.spawn(async move {
            edge.spawn_supervisor().wait().await;
        });
    }
    wait_connected(&handle, true).await;

    // a request is mid-flight (held open by the gate)...
    let inflight = tokio::spawn(roundtrip(
        ingress,
        b"GET /bucketA/k HTTP/1.1\r\nhost: s\r\n\r\n",
    ));
    tokio::time::sleep(Duration::from_millis(500)).await;

    // ...when the whole edge process dies
    rt.shutdown_background();
    drop(gate_tx);

    let (status, _, body) = inflight.await.unwrap();
    assert_eq!(status, 502);
    assert!(body.starts_with(b"Proxy Error:"), "{:?}", String::from_utf8_lossy(&body));
    wait_connected(&handle, false).await;

    // a replacement edge re-establishes the control channel and serves
    let store = Arc::new(MemoryStore::new(["default", "bucketA"]));
    store
        .put("bucketA", "k", Bytes::from_static(b"v2"), PutOptions::default())
        .await
        .unwrap();
    let (edge2, _status_tx2) = make_edge(&config, store);
    edge2.spawn_supervisor();
    wait_connected(&handle, true).await;

    let (status, _, body) = roundtrip(
        ingress,
        b"GET /bucketA/k HTTP/1.1\r\nhost: s\r\n\r\n",
    )
    .await;
    assert_eq!((status, body.as_slice()), (200, &b"v2"[..]));
}

#[tokio::test]
async fn delete_is_idempotent_through_the_fabric() {
    let fabric = start_fabric(2).await;
    for _ in 0..2 {
        let (status, _, _) = roundtrip(
            fabric.ingress,
            b"DELETE /bucketA/never HTTP/1.1\r\nhost: s\r\n\r\n",
        )
        .await;
        assert_eq!(status, 204);
    }
}

#[tokio::test]
async fn list_through_the_fabric_returns_xml() {
    let fabric = start_fabric(2).await;
    for key in ["logs/a", "logs/b", "root"] {
        fabric
            .store
            .put("bucketA", key, Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap();
    }
    let (status, headers, body) = roundtrip(
        fabric.ingress,
        b"GET /bucketA?delimiter=%2F&max-keys=100 HTTP/1.1\r\nhost: s\r\n\r\n",
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(headers["content-type"], "application/xml");
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("<ListBucketResult"));
    assert!(text.contains("<Prefix>logs/</Prefix>"));
    assert!(text.contains("<Key>root</Key>"));
}
