use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use viaduct::config::Config;
use viaduct::proxy::worker;

const HEAD_END: &[u8] = b"\r\n\r\n";

/// Start a single-worker proxy on an ephemeral port.
fn start_proxy(accept_capacity: usize) -> std::net::SocketAddr {
    let config = Config {
        port: 0,
        accept_threads: 1,
        accept_capacity,
        name_cache: 16,
        cache_lifetime: 60,
        ..Config::default()
    };
    let handle = worker::spawn(Arc::new(config), 0).expect("failed to start worker");
    let addr = handle.local_addr;
    // the worker thread runs for the lifetime of the test binary
    std::mem::forget(handle);
    addr
}

/// Read from `stream` until the CRLFCRLF head terminator; returns the head
/// (terminator included) and any body bytes that arrived with it.
async fn read_head(stream: &mut TcpStream) -> (Vec<u8>, Vec<u8>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        if let Some(pos) = data.windows(HEAD_END.len()).position(|w| w == HEAD_END) {
            let split = pos + HEAD_END.len();
            let body = data.split_off(split);
            return (data, body);
        }
        let n = stream.read(&mut buf).await.expect("read failed");
        assert!(n > 0, "connection closed before head completed");
        data.extend_from_slice(&buf[..n]);
    }
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.expect("read_exact failed");
    data
}

/// Deterministic pseudo-random byte generator for body payloads and split
/// sizes (no external dependency needed for this).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 16
    }

    fn bytes(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.next() as u8).collect()
    }
}

#[tokio::test]
async fn test_e1_get_keep_alive() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_addr = upstream.local_addr().unwrap();
    let proxy = start_proxy(8);

    let server = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        for _ in 0..2 {
            let (head, body) = read_head(&mut conn).await;
            assert!(body.is_empty());
            let expected = format!(
                "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nVia: 1.1 127.0.0.1\r\nX-Forwarded-For: 127.0.0.1\r\n\r\n",
                up_addr.port()
            );
            assert_eq!(String::from_utf8_lossy(&head), expected);
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        }
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", up_addr.port());
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    // two cycles over the same client connection exercise keep-alive reuse
    for _ in 0..2 {
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_exact_len(&mut client, expected.len()).await;
        assert_eq!(response, expected);
    }

    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_e2_post_body_split_across_writes() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_addr = upstream.local_addr().unwrap();
    let proxy = start_proxy(8);

    let body = Lcg(42).bytes(10_000);
    let body_for_server = body.clone();

    let server = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let (head, mut got) = read_head(&mut conn).await;
        assert!(head.starts_with(b"POST /upload HTTP/1.1\r\n"));
        while got.len() < body_for_server.len() {
            let mut buf = [0u8; 4096];
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0, "upstream connection closed mid-body");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, body_for_server);
        conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {}\r\n\r\n",
        up_addr.port(),
        body.len()
    );
    client.write_all(head.as_bytes()).await.unwrap();

    // eleven writes of varying size
    let mut sent = 0;
    for i in 0..11 {
        let take = if i == 10 {
            body.len() - sent
        } else {
            (body.len() / 11).max(1)
        };
        client.write_all(&body[sent..sent + take]).await.unwrap();
        sent += take;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let response = read_exact_len(&mut client, expected.len()).await;
    assert_eq!(response, expected);

    timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_e3_chunked_response_passes_through() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_addr = upstream.local_addr().unwrap();
    let proxy = start_proxy(8);

    let response: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                            5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

    let server = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let _ = read_head(&mut conn).await;
        conn.write_all(response).await.unwrap();
        // keep the connection open; the proxy must find the body end from
        // the chunk framing, not from EOF
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", up_addr.port());
    client.write_all(request.as_bytes()).await.unwrap();

    let got = read_exact_len(&mut client, response.len()).await;
    assert_eq!(got, response);

    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_e4_http10_close_delimited_body() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_addr = upstream.local_addr().unwrap();
    let proxy = start_proxy(8);

    let body = Lcg(7).bytes(20_000);
    let body_for_server = body.clone();

    let server = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let _ = read_head(&mut conn).await;
        conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        conn.write_all(&body_for_server).await.unwrap();
        // no Content-Length: the body is delimited by this close
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET / HTTP/1.0\r\nHost: 127.0.0.1:{}\r\n\r\n", up_addr.port());
    client.write_all(request.as_bytes()).await.unwrap();

    let mut got = Vec::new();
    timeout(Duration::from_secs(10), client.read_to_end(&mut got))
        .await
        .expect("proxy did not close after upstream FIN")
        .unwrap();

    let mut expected = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
    expected.extend_from_slice(&body);
    assert_eq!(got, expected);

    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_e5_upstream_connect_refused_yields_502() {
    let proxy = start_proxy(8);

    // grab an ephemeral port and close it again so connects are refused
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{dead_port}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut got = Vec::new();
    timeout(Duration::from_secs(10), client.read_to_end(&mut got))
        .await
        .expect("proxy did not close after the 502")
        .unwrap();

    let expected = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\nConnection refused (111)";
    assert_eq!(String::from_utf8_lossy(&got), String::from_utf8_lossy(expected));
}

#[tokio::test]
async fn test_e6_pool_exhaustion_rejects_exactly_one() {
    let proxy = start_proxy(4);

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(proxy).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut closed = 0;
    for client in &mut clients {
        let mut buf = [0u8; 1];
        match timeout(Duration::from_millis(100), client.read(&mut buf)).await {
            Ok(Ok(0)) => closed += 1,
            Ok(Ok(_)) => panic!("unexpected data from proxy"),
            Ok(Err(_)) => closed += 1,
            Err(_) => {} // still admitted and idle
        }
    }
    assert_eq!(closed, 1, "exactly one connection must be rejected");

    // released sessions return their slots: a fresh batch is admitted
    drop(clients);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut fresh = Vec::new();
    for _ in 0..4 {
        fresh.push(TcpStream::connect(proxy).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    for client in &mut fresh {
        let mut buf = [0u8; 1];
        match timeout(Duration::from_millis(100), client.read(&mut buf)).await {
            Ok(Ok(0)) => panic!("slot was not recycled after release"),
            Ok(Ok(_)) => panic!("unexpected data from proxy"),
            Ok(Err(err)) => panic!("unexpected error from proxy: {err}"),
            Err(_) => {}
        }
    }
}

#[tokio::test]
async fn test_body_byte_exactness_under_random_splits() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_addr = upstream.local_addr().unwrap();
    let proxy = start_proxy(8);

    const BODY_LEN: usize = 100_000;
    let request_body = Lcg(1234).bytes(BODY_LEN);
    let response_body = Lcg(5678).bytes(BODY_LEN);

    let request_body_server = request_body.clone();
    let response_body_server = response_body.clone();

    let server = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let (_, mut got) = read_head(&mut conn).await;
        while got.len() < BODY_LEN {
            let mut buf = [0u8; 8192];
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0, "upstream connection closed mid-body");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, request_body_server, "request body was corrupted");

        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {BODY_LEN}\r\n\r\n");
        conn.write_all(head.as_bytes()).await.unwrap();
        // push the response out in random-sized slices as well
        let mut rng = Lcg(99);
        let mut sent = 0;
        while sent < BODY_LEN {
            let take = ((rng.next() as usize) % 4096 + 1).min(BODY_LEN - sent);
            conn.write_all(&response_body_server[sent..sent + take])
                .await
                .unwrap();
            sent += take;
        }
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let head = format!(
        "POST /blob HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {BODY_LEN}\r\n\r\n",
        up_addr.port()
    );
    client.write_all(head.as_bytes()).await.unwrap();

    let mut rng = Lcg(4321);
    let mut sent = 0;
    while sent < BODY_LEN {
        let take = ((rng.next() as usize) % 4096 + 1).min(BODY_LEN - sent);
        client.write_all(&request_body[sent..sent + take]).await.unwrap();
        sent += take;
    }

    let (head, body_start) = read_head(&mut client).await;
    assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
    let mut got = body_start;
    while got.len() < BODY_LEN {
        let mut buf = [0u8; 8192];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0, "proxy closed mid-body");
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, response_body, "response body was corrupted");

    timeout(Duration::from_secs(30), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_chunked_request_body_forwarded_as_is() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_addr = upstream.local_addr().unwrap();
    let proxy = start_proxy(8);

    let chunked_body: &[u8] = b"4\r\nwiki\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n";

    let server = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let (head, mut got) = read_head(&mut conn).await;
        assert!(head
            .windows(b"Transfer-Encoding: chunked".len())
            .any(|w| w == b"Transfer-Encoding: chunked"));
        while got.len() < chunked_body.len() {
            let mut buf = [0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        // chunked framing is forwarded untouched, still chunked
        assert_eq!(got, chunked_body);
        conn.write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let head = format!(
        "POST /chunks HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nTransfer-Encoding: chunked\r\n\r\n",
        up_addr.port()
    );
    client.write_all(head.as_bytes()).await.unwrap();
    // send the framing byte by byte to stress marker reassembly
    for b in chunked_body {
        client.write_all(std::slice::from_ref(b)).await.unwrap();
    }

    let expected = b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n";
    let response = read_exact_len(&mut client, expected.len()).await;
    assert_eq!(response, expected);

    timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
}
