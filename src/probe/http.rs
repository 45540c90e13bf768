//! Minimal HTTP/1.1 over a SOCKS5 or HTTP CONNECT tunnel, with optional TLS.

use crate::protocol::client::{connect, negotiate};
use crate::protocol::{Address, ProxyEndpoint, ProxyKind};
use crate::utils::error::{Result, SpeedtestError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::Url;

pub const USER_AGENT: &str = concat!("stairspeed/", env!("CARGO_PKG_VERSION"));

const MAX_HEAD_BYTES: usize = 16 * 1024;

pub trait ProxyIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyIo for T {}

pub type BoxedIo = Box<dyn ProxyIo>;

/// Parsed request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub host_header: String,
}

impl HttpTarget {
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| SpeedtestError::Http(format!("invalid URL {}: {}", s, e)))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(SpeedtestError::Http(format!(
                    "unsupported URL scheme: {}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| SpeedtestError::Http(format!("missing host in URL {}", s)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
        let mut path = url.path().to_string();
        if path.is_empty() {
            path = "/".to_string();
        }
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        let host_header = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.clone(),
        };
        Ok(Self {
            tls,
            host,
            port,
            path,
            host_header,
        })
    }

    pub fn get_request(&self) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            self.path, self.host_header, USER_AGENT
        )
    }

    pub fn post_request(&self, content_length: u64) -> String {
        format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.path, self.host_header, USER_AGENT, content_length
        )
    }
}

/// Status line and framing of a response; `body_prefix` holds body bytes
/// that arrived together with the headers.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body_prefix: BytesMut,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Read and parse the response head.
pub async fn read_response_head<S>(stream: &mut S) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(SpeedtestError::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(SpeedtestError::Http("response head too large".to_string()));
        }
    };

    let body_prefix = buf.split_off(head_end);
    let head = String::from_utf8_lossy(&buf);
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(SpeedtestError::Http(format!(
            "malformed status line: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| SpeedtestError::Http(format!("malformed status line: {}", status_line)))?;

    let content_length = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<u64>().ok()
        } else {
            None
        }
    });

    Ok(ResponseHead {
        status,
        content_length,
        body_prefix,
    })
}

/// Opens streams to HTTP(S) targets through a proxy.
#[derive(Clone)]
pub struct HttpClient {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl HttpClient {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| SpeedtestError::Tls(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// TCP stream to `host:port`, either direct or tunnelled through `proxy`.
    pub async fn tunnel(
        &self,
        proxy: Option<&ProxyEndpoint>,
        host: &str,
        port: u16,
    ) -> Result<TcpStream> {
        timeout(self.connect_timeout, async {
            let Some(proxy) = proxy else {
                return Ok(TcpStream::connect((host, port)).await?);
            };
            let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
            match proxy.kind {
                ProxyKind::Socks5 => {
                    negotiate(&mut stream, proxy.credentials.as_ref()).await?;
                    connect(&mut stream, &Address::from_host(host), port).await?;
                }
                ProxyKind::Http => http_connect(&mut stream, proxy, host, port).await?,
            }
            Ok(stream)
        })
        .await
        .map_err(|_| SpeedtestError::timeout("proxy tunnel"))?
    }

    /// Tunnel plus TLS when the target is https.
    pub async fn open(&self, proxy: Option<&ProxyEndpoint>, target: &HttpTarget) -> Result<BoxedIo> {
        let stream = self.tunnel(proxy, &target.host, target.port).await?;
        if !target.tls {
            return Ok(Box::new(stream));
        }
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| SpeedtestError::Tls(format!("invalid server name {}", target.host)))?;
        let tls = timeout(self.connect_timeout, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| SpeedtestError::timeout("TLS handshake"))?
            .map_err(|e| SpeedtestError::Tls(e.to_string()))?;
        Ok(Box::new(tls))
    }

    /// Send a GET and return the stream positioned after the response head.
    pub async fn get(
        &self,
        proxy: Option<&ProxyEndpoint>,
        target: &HttpTarget,
    ) -> Result<(BoxedIo, ResponseHead)> {
        let mut io = self.open(proxy, target).await?;
        io.write_all(target.get_request().as_bytes()).await?;
        io.flush().await?;
        let head = timeout(self.connect_timeout, read_response_head(&mut io))
            .await
            .map_err(|_| SpeedtestError::timeout("HTTP response"))??;
        Ok((io, head))
    }
}

async fn http_connect(
    stream: &mut TcpStream,
    proxy: &ProxyEndpoint,
    host: &str,
    port: u16,
) -> Result<()> {
    let authority = match Address::from_host(host) {
        Address::IPv6(_) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    };
    let mut req = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nUser-Agent: {1}\r\nProxy-Connection: Keep-Alive\r\n",
        authority, USER_AGENT
    );
    if let Some(creds) = &proxy.credentials {
        let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
        req.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await?;

    let head = read_response_head(stream).await?;
    if !head.is_success() {
        return Err(SpeedtestError::Http(format!(
            "proxy CONNECT returned {}",
            head.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Credentials;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target() {
        let t = HttpTarget::parse("https://www.google.com/").unwrap();
        assert!(t.tls);
        assert_eq!(t.port, 443);
        assert_eq!(t.path, "/");
        assert_eq!(t.host_header, "www.google.com");

        let t = HttpTarget::parse("http://speed.example:3004/upload?time=0").unwrap();
        assert!(!t.tls);
        assert_eq!(t.port, 3004);
        assert_eq!(t.path, "/upload?time=0");
        assert_eq!(t.host_header, "speed.example:3004");

        assert!(HttpTarget::parse("ftp://example.com/file").is_err());
    }

    #[tokio::test]
    async fn test_read_response_head() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX: y\r\n\r\nhello";
        let mut reader = raw;
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(5));
        assert_eq!(&head.body_prefix[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_response_head_rejects_garbage() {
        let raw: &[u8] = b"SSH-2.0-OpenSSH\r\n\r\n";
        let mut reader = raw;
        assert!(read_response_head(&mut reader).await.is_err());

        let mut closed: &[u8] = b"HTTP/1.1 200";
        assert!(matches!(
            read_response_head(&mut closed).await,
            Err(SpeedtestError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_http_connect_sends_basic_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            req
        });

        let proxy = ProxyEndpoint {
            kind: ProxyKind::Http,
            host: "127.0.0.1".to_string(),
            port,
            credentials: Some(Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
        };
        let client = HttpClient::new(Duration::from_secs(2)).unwrap();
        client
            .tunnel(Some(&proxy), "example.com", 443)
            .await
            .unwrap();

        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(req.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }
}
