use crate::network::{Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::{header, Method, Request, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error};

const USER_AGENT: &str = "abr-player/1.0";

/// Plain HTTP/1 transport: one connection per request.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;
        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(TransportError::InvalidUrl(format!(
                "{}: only http is supported",
                url
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing host", url)))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);

        let io = Self::get_io(&host, port).await?;
        let (mut sender, conn) = http1::handshake::<_, Empty<Bytes>>(io)
            .await
            .map_err(|e| TransportError::ConnectError(format!("http1 handshake: {}", e)))?;
        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                error!("connection: {:?}", err);
            }
        });

        let path = uri
            .path_and_query()
            .map(|pnq| pnq.as_str())
            .unwrap_or("/")
            .to_string();
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::HOST, format!("{}:{}", host, port))
            .header(header::USER_AGENT, USER_AGENT)
            .body(Empty::<Bytes>::new())
            .map_err(|e| TransportError::Unexpected(format!("build request: {}", e)))?;

        let res = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::ConnectError(format!("send request: {}", e)))?;
        let status = res.status();
        if !status.is_success() {
            return Err(TransportError::StatusError(status.as_u16()));
        }

        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::BodyError(format!("read body: {}", e)))?
            .to_bytes();
        debug!("GET {}: {} bytes", url, body.len());
        Ok(body)
    }

    async fn get_io(host: &str, port: u16) -> Result<TokioIo<TcpStream>, TransportError> {
        let addr = format!("{}:{}", host, port);
        let tcp_stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|e| TransportError::ConnectError(format!("connect to {}: {}", addr, e)))?;
        Ok(TokioIo::new(tcp_stream))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Bytes, TransportError> {
        match tokio::time::timeout(self.timeout, self.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "{} after {:?}",
                url, self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/video/1/0.m4s", addr)
    }

    #[tokio::test]
    async fn fetches_body() {
        let url =
            serve_once(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello")
                .await;
        let transport = HttpTransport::new(Duration::from_secs(5));
        let body = transport.get(&url).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn error_status_is_transient() {
        let url = serve_once(
            b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let transport = HttpTransport::new(Duration::from_secs(5));
        let err = transport.get(&url).await.unwrap_err();
        assert_eq!(err, TransportError::StatusError(503));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_url_is_final() {
        let transport = HttpTransport::new(Duration::from_secs(1));
        let err = transport.get("https://example.com/a").await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
        assert!(!err.is_transient());
    }
}
