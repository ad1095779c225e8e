//! Black-box scenarios over a real loopback TCP connection, driving a
//! bound `NetworkServer` the way a real client would: writing length-framed
//! requests and reading length-framed responses off the socket.

use bytes::{BufMut, Bytes, BytesMut};
use partition_rpc::cluster::fake::FakeCoordinator;
use partition_rpc::config::Config;
use partition_rpc::envelope::{Envelope, RequestId, Status};
use partition_rpc::node::Node;
use partition_rpc::server::NetworkServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    });
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn bound_server(config: Config, port: u16) -> Arc<NetworkServer> {
    init_tracing();
    let coordinator = Arc::new(FakeCoordinator::new().with_node(Node::new(1, format!("127.0.0.1:{port}"), [0])));
    let server = NetworkServer::new(config, coordinator);
    server.bind(1, true, 0).await.unwrap();
    server
}

async fn connect(port: u16) -> TcpStream {
    // The acceptor spawns asynchronously right after `bind` returns.
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("could not connect to bound server");
}

async fn send_request(stream: &mut TcpStream, id: RequestId, name: &str, payload: &[u8]) {
    let envelope = Envelope::request(id, name, Bytes::copy_from_slice(payload));
    let mut body = BytesMut::new();
    envelope.encode(&mut body);
    let mut frame = BytesMut::with_capacity(body.len() + 4);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await.unwrap();
}

async fn read_response(stream: &mut TcpStream) -> Envelope {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    Envelope::decode(Bytes::from(body)).unwrap()
}

#[tokio::test]
async fn s1_echo() {
    let port = free_port().await;
    let server = bound_server(Config::default(), port).await;
    server.registry().register("echo", "bytes", "bytes", Arc::new(|_ctx, payload| Box::pin(async move { Ok(payload) })));

    let mut stream = connect(port).await;
    let id = RequestId::new(0x0123_4567_89AB_CDEF, 1);
    send_request(&mut stream, id, "echo", b"hi").await;

    let response = read_response(&mut stream).await;
    assert_eq!(response.request_id, id);
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.payload, Bytes::from_static(b"hi"));

    server.shutdown().await;
}

#[tokio::test]
async fn s2_queue_timeout_sheds_second_request_while_first_completes() {
    let port = free_port().await;
    let config = Config::default()
        .with_request_timeout_ms(50)
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_queue_size(10);
    let server = bound_server(config, port).await;

    server.registry().register(
        "slow",
        "bytes",
        "bytes",
        Arc::new(|_ctx, payload| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                Ok(payload)
            })
        }),
    );
    server.registry().register("echo", "bytes", "bytes", Arc::new(|_ctx, payload| Box::pin(async move { Ok(payload) })));

    let mut stream1 = connect(port).await;
    let mut stream2 = connect(port).await;

    let slow_id = RequestId::new(1, 1);
    send_request(&mut stream1, slow_id, "slow", b"a").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let echo_id = RequestId::new(2, 2);
    send_request(&mut stream2, echo_id, "echo", b"b").await;

    let second = read_response(&mut stream2).await;
    assert_eq!(second.status, Status::Error);
    assert!(second.error_message.unwrap().contains("Timeout"));

    let first = read_response(&mut stream1).await;
    assert_eq!(first.status, Status::Ok);
    assert_eq!(first.payload, Bytes::from_static(b"a"));

    server.shutdown().await;
}

#[tokio::test]
async fn s3_service_timeout_fires_once_and_discards_late_completion() {
    let port = free_port().await;
    let config = Config::default().with_response_generation_timeout_ms(100);
    let server = bound_server(config, port).await;

    server.registry().register(
        "slow",
        "bytes",
        "bytes",
        Arc::new(|_ctx, payload| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(payload)
            })
        }),
    );

    let mut stream = connect(port).await;
    let id = RequestId::new(5, 5);
    let started = tokio::time::Instant::now();
    send_request(&mut stream, id, "slow", b"z").await;

    let response = read_response(&mut stream).await;
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(response.status, Status::Error);
    assert!(response.error_message.unwrap().contains("Timeout"));

    // No second frame follows the timeout response on this connection.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let mut probe = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_millis(50), stream.peek(&mut probe)).await;
    assert!(result.is_err() || matches!(result, Ok(Ok(0))));

    server.shutdown().await;
}

#[tokio::test]
async fn s4_no_handler() {
    let port = free_port().await;
    let server = bound_server(Config::default(), port).await;

    let mut stream = connect(port).await;
    let id = RequestId::new(9, 9);
    send_request(&mut stream, id, "unknown", b"").await;

    let response = read_response(&mut stream).await;
    assert_eq!(response.status, Status::Error);
    assert!(response.error_message.unwrap().contains("NoHandler"));

    server.shutdown().await;
}

#[tokio::test]
async fn s7_mark_unavailable_is_recorded_and_reconnect_does_not_remark_without_mark_available() {
    let port = free_port().await;
    let coordinator = Arc::new(FakeCoordinator::new().with_node(Node::new(1, format!("127.0.0.1:{port}"), [0])));
    let server = NetworkServer::new(Config::default(), coordinator.clone());
    server.bind(1, true, 0).await.unwrap();

    server.mark_unavailable().await.unwrap();
    assert_eq!(coordinator.unavailable_calls.lock().as_slice(), &[1]);

    coordinator.fire(partition_rpc::cluster::ClusterEvent::Connected(vec![]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    // mark_when_connected was cleared by mark_unavailable, so no further
    // mark_node_available call should have been recorded.
    assert_eq!(coordinator.available_calls.lock().len(), 1); // only the initial bind-time call

    server.shutdown().await;
}
