use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use n0_future::task::AbortOnDropHandle;
use tracing_test::traced_test;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, tcp::OwnedReadHalf};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::config::{Config, ProxySection, Strategy, Upstream, UpstreamKind};
use crate::parse::{RequestHead, ResponseHead};
use crate::server::ProxyServer;
use crate::sniff::Prefixed;
use crate::tls::install_crypto_provider;

const TEST_DEADLINE: Duration = Duration::from_secs(2);

// -- Test helpers --

fn base_config() -> Config {
    Config {
        proxy: ProxySection {
            port: 0,
            ..Default::default()
        },
    }
}

fn socks5_upstream(addr: SocketAddr) -> Upstream {
    Upstream {
        enabled: true,
        kind: UpstreamKind::Socks5,
        host: addr.ip().to_string(),
        port: addr.port(),
        process: None,
        health_check: None,
    }
}

fn v4_addr(server: &ProxyServer) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
}

/// Spawns a TCP echo server.
async fn spawn_echo_server() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a SOCKS5 stub that accepts the no-auth CONNECT handshake,
/// records its `index` into `hits`, and then echoes the tunnel bytes.
async fn spawn_socks5_stub(
    index: usize,
    hits: Arc<Mutex<Vec<usize>>>,
) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let hits = hits.clone();
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                stream.read_exact(&mut greeting).await.unwrap();
                assert_eq!(greeting[0], 0x05);
                let mut methods = vec![0u8; greeting[1] as usize];
                stream.read_exact(&mut methods).await.unwrap();
                stream.write_all(&[0x05, 0x00]).await.unwrap();

                let mut header = [0u8; 4];
                stream.read_exact(&mut header).await.unwrap();
                assert_eq!(&header[..3], &[0x05, 0x01, 0x00]);
                let addr_len = match header[3] {
                    0x01 => 4 + 2,
                    0x04 => 16 + 2,
                    0x03 => {
                        let mut len = [0u8; 1];
                        stream.read_exact(&mut len).await.unwrap();
                        len[0] as usize + 2
                    }
                    other => panic!("unexpected address type {other}"),
                };
                let mut target = vec![0u8; addr_len];
                stream.read_exact(&mut target).await.unwrap();

                hits.lock().unwrap().push(index);
                stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();

                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Reads and consumes one HTTP response head from a prefixed reader.
async fn read_response_head(reader: &mut Prefixed<OwnedReadHalf>) -> Result<ResponseHead> {
    loop {
        if let Some((len, head)) = ResponseHead::parse(reader.peeked())? {
            reader.discard(len);
            return Ok(head);
        }
        let n = reader.read_more(usize::MAX).await?;
        ensure_any!(n > 0, "connection closed before the response head");
    }
}

/// Opens a CONNECT tunnel through the proxy and returns the joined stream.
async fn open_connect_tunnel(
    proxy: SocketAddr,
    target: &str,
) -> Result<tokio::io::Join<Prefixed<OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf>> {
    let stream = TcpStream::connect(proxy).await?;
    let (recv, mut send) = stream.into_split();
    send.write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;
    let mut recv = Prefixed::new(recv, crate::HEADER_SECTION_MAX_LENGTH);
    let head = read_response_head(&mut recv)
        .timeout(TEST_DEADLINE)
        .await
        .std_context("timed out waiting for the CONNECT response")??;
    if head.status != 200 {
        return Err(anyerr!("proxy refused the tunnel: {}", head.status));
    }
    Ok(tokio::io::join(recv, send))
}

/// Writes `payload` into the tunnel and expects it echoed back.
async fn assert_echo(
    tunnel: &mut (impl AsyncRead + AsyncWrite + Unpin),
    payload: &[u8],
) -> Result<()> {
    tunnel.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    tunnel
        .read_exact(&mut buf)
        .timeout(TEST_DEADLINE)
        .await
        .std_context("timed out waiting for the echo")??;
    ensure_any!(buf == payload, "echo mismatch");
    Ok(())
}

// -- End-to-end scenarios --

#[tokio::test]
#[traced_test]
async fn clear_connect_with_direct_upstream() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let mut server = ProxyServer::start(base_config()).await?;

    // The listener is dual stack; reach it over v6 loopback.
    let proxy = SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, server.local_addr().port()));
    let mut tunnel = open_connect_tunnel(proxy, &echo_addr.to_string()).await?;
    assert_echo(&mut tunnel, b"ping").await?;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn forward_request_is_rewritten_to_origin_form() -> Result {
    // Origin asserts the rewritten request line and the untouched header.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let origin_addr = listener.local_addr()?;
    let origin = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.split();
        let mut reader = Prefixed::new(read, crate::HEADER_SECTION_MAX_LENGTH);
        let (len, head) = RequestHead::peek(&mut reader).await.unwrap();
        let raw = String::from_utf8_lossy(&reader.peeked()[..len]).to_string();
        assert!(raw.starts_with("GET /foo HTTP/1.1\r\n"), "got {raw:?}");
        assert!(raw.contains("\r\nX-T: 1\r\n"), "got {raw:?}");
        assert_eq!(head.method, "GET");
        write
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });
    let _origin = AbortOnDropHandle::new(origin);

    let mut server = ProxyServer::start(base_config()).await?;
    let mut client = TcpStream::connect(v4_addr(&server)).await?;
    client
        .write_all(
            format!(
                "GET http://{origin_addr}/foo HTTP/1.1\r\nHost: {origin_addr}\r\nX-T: 1\r\n\r\n"
            )
            .as_bytes(),
        )
        .await?;
    client.shutdown().await?;

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .timeout(TEST_DEADLINE)
        .await
        .std_context("timed out reading the response")??;
    assert_eq!(
        String::from_utf8_lossy(&response),
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn forward_request_works_for_a_real_http_client() -> Result {
    // Same path as above, driven by reqwest in proxy mode.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let origin_addr = listener.local_addr()?;
    let origin = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (read, mut write) = stream.split();
                let mut reader = Prefixed::new(read, crate::HEADER_SECTION_MAX_LENGTH);
                let (_, head) = RequestHead::peek(&mut reader).await.unwrap();
                let body = format!("{} {}", head.method, head.target);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                write.write_all(response.as_bytes()).await.unwrap();
            });
        }
    });
    let _origin = AbortOnDropHandle::new(origin);

    let mut server = ProxyServer::start(base_config()).await?;
    let proxy_url = format!("http://{}", v4_addr(&server));
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(&proxy_url).anyerr()?)
        .pool_max_idle_per_host(0)
        .build()
        .anyerr()?;

    let response = client
        .get(format!("http://{origin_addr}/hello"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.anyerr()?;
    assert_eq!(body, "GET /hello");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn tls_terminated_connect_behaves_like_clear() -> Result {
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    install_crypto_provider();
    let (echo_addr, _echo) = spawn_echo_server().await?;

    let mut config = base_config();
    config.proxy.use_https = true;
    let mut server = ProxyServer::start(config).await?;

    // Trust the proxy's ephemeral certificate directly.
    let mut roots = RootCertStore::empty();
    roots
        .add(server.tls_cert().context("missing tls cert")?.leaf_der().clone())
        .anyerr()?;
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(v4_addr(&server)).await?;
    let name = ServerName::try_from("localhost").anyerr()?;
    let mut tls = connector.connect(name, tcp).await?;

    tls.write_all(
        format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes(),
    )
    .await?;
    let mut response = [0u8; 39];
    tls.read_exact(&mut response)
        .timeout(TEST_DEADLINE)
        .await
        .std_context("timed out waiting for the CONNECT response")??;
    assert_eq!(&response[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

    assert_echo(&mut tls, b"ping through tls").await?;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tls_hello_without_https_closes_the_connection() -> Result {
    let mut server = ProxyServer::start(base_config()).await?;
    let mut client = TcpStream::connect(v4_addr(&server)).await?;
    client.write_all(&[0x16, 0x03, 0x01, 0x00, 0x05]).await?;

    let mut buf = Vec::new();
    let n = client
        .read_to_end(&mut buf)
        .timeout(TEST_DEADLINE)
        .await
        .std_context("connection was not closed")??;
    assert_eq!(n, 0, "client must receive nothing");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn failover_skips_a_dead_upstream() -> Result {
    // First upstream: bound once and dropped, so connects are refused.
    let dead = TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = dead.local_addr()?;
    drop(dead);

    let hits = Arc::new(Mutex::new(Vec::new()));
    let (good_addr, _stub) = spawn_socks5_stub(1, hits.clone()).await?;

    let mut config = base_config();
    config.proxy.upstreams = vec![socks5_upstream(dead_addr), socks5_upstream(good_addr)];
    let mut server = ProxyServer::start(config).await?;

    let mut tunnel = open_connect_tunnel(v4_addr(&server), "example.test:443").await?;
    assert_echo(&mut tunnel, b"failover ping").await?;
    assert_eq!(hits.lock().unwrap().as_slice(), &[1]);
    assert!(logs_contain("upstream attempt failed"));
    assert!(logs_contain("connected via upstream"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn round_robin_rotates_across_healthy_upstreams() -> Result {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let mut upstreams = Vec::new();
    let mut stubs = Vec::new();
    for index in 0..3 {
        let (addr, stub) = spawn_socks5_stub(index, hits.clone()).await?;
        upstreams.push(socks5_upstream(addr));
        stubs.push(stub);
    }

    let mut config = base_config();
    config.proxy.upstreams = upstreams;
    config.proxy.load_balancing_strategy = Strategy::RoundRobin;
    let mut server = ProxyServer::start(config).await?;

    for round in 0..6 {
        let mut tunnel = open_connect_tunnel(v4_addr(&server), "example.test:443").await?;
        assert_echo(&mut tunnel, format!("round {round}").as_bytes()).await?;
        debug!(round, "tunnel served");
    }

    let order = hits.lock().unwrap().clone();
    assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn the_legacy_single_upstream_is_merged_ahead_of_the_list() -> Result {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let (legacy_addr, _legacy) = spawn_socks5_stub(0, hits.clone()).await?;
    let (listed_addr, _listed) = spawn_socks5_stub(1, hits.clone()).await?;

    let mut config = base_config();
    config.proxy.upstream = Some(socks5_upstream(legacy_addr));
    config.proxy.upstreams = vec![socks5_upstream(listed_addr)];
    let mut server = ProxyServer::start(config).await?;

    // Failover: the legacy entry is first and healthy, so it serves.
    let mut tunnel = open_connect_tunnel(v4_addr(&server), "example.test:443").await?;
    assert_echo(&mut tunnel, b"legacy first").await?;
    assert_eq!(hits.lock().unwrap().as_slice(), &[0]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn http_upstream_entries_tunnel_via_connect() -> Result {
    // A second hopgate instance acts as the HTTP upstream proxy.
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let mut inner = ProxyServer::start(base_config()).await?;

    let mut config = base_config();
    config.proxy.upstreams = vec![Upstream {
        enabled: true,
        kind: UpstreamKind::Http,
        host: "127.0.0.1".to_string(),
        port: inner.local_addr().port(),
        process: None,
        health_check: None,
    }];
    let mut outer = ProxyServer::start(config).await?;

    let mut tunnel = open_connect_tunnel(v4_addr(&outer), &echo_addr.to_string()).await?;
    assert_echo(&mut tunnel, b"chained").await?;

    outer.shutdown().await;
    inner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn connect_failure_yields_no_proxy_response() -> Result {
    // A refused target behind an empty upstream list: the client sees the
    // connection close without any status line.
    let refused = TcpListener::bind("127.0.0.1:0").await?;
    let refused_addr = refused.local_addr()?;
    drop(refused);

    let mut server = ProxyServer::start(base_config()).await?;
    let mut client = TcpStream::connect(v4_addr(&server)).await?;
    client
        .write_all(format!("CONNECT {refused_addr} HTTP/1.1\r\n\r\n").as_bytes())
        .await?;

    let mut buf = Vec::new();
    client
        .read_to_end(&mut buf)
        .timeout(TEST_DEADLINE)
        .await
        .std_context("connection was not closed")??;
    assert!(buf.is_empty(), "got unexpected bytes: {buf:?}");

    server.shutdown().await;
    Ok(())
}
