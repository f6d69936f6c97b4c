//! Upstream connection dialing: plain TCP, implicit TLS, and SOCKS5.
//!
//! Provides a unified stream type that can be either TLS-encrypted or
//! plain TCP. Providers with credentials require TLS; the dialer never
//! falls back to plaintext for them.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{ProviderConfig, ProxyConfig};
use crate::error::{Result, SpoolError};

/// A stream that can be either TLS-encrypted or plain TCP.
pub enum ConnStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Create a TLS connector using the bundled webpki root certificates.
fn tls_connector() -> TlsConnector {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Dial a provider: TCP (optionally through its SOCKS5 proxy), then TLS
/// when configured. Credentialed providers must be TLS.
pub async fn dial(provider: &ProviderConfig, connect_timeout: Duration) -> Result<ConnStream> {
    if provider.has_credentials() && !provider.ssl {
        return Err(SpoolError::Nntp(format!(
            "provider {} has credentials but ssl is disabled",
            provider.name
        )));
    }

    let tcp = timeout(connect_timeout, open_tcp(provider))
        .await
        .map_err(|_| {
            SpoolError::Nntp(format!("connection timeout to {}", provider.addr()))
        })??;

    if !provider.ssl {
        return Ok(ConnStream::Plain(tcp));
    }

    let server_name = ServerName::try_from(provider.host.clone())
        .map_err(|e| SpoolError::Nntp(format!("invalid TLS server name: {}", e)))?;
    let tls = timeout(connect_timeout, tls_connector().connect(server_name, tcp))
        .await
        .map_err(|_| SpoolError::Nntp(format!("TLS timeout to {}", provider.addr())))??;
    Ok(ConnStream::Tls(Box::new(tls)))
}

async fn open_tcp(provider: &ProviderConfig) -> Result<TcpStream> {
    match provider.proxy.as_ref().filter(|p| p.enabled) {
        Some(proxy) => {
            let mut stream = TcpStream::connect(proxy.addr()).await?;
            socks5_connect(&mut stream, proxy, &provider.host, provider.port).await?;
            Ok(stream)
        }
        None => Ok(TcpStream::connect(provider.addr()).await?),
    }
}

/// SOCKS5 CONNECT handshake (RFC 1928, RFC 1929 username/password auth).
async fn socks5_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<()> {
    let with_auth = proxy.username.is_some() && proxy.password.is_some();
    let method: u8 = if with_auth { 0x02 } else { 0x00 };
    stream.write_all(&[0x05, 0x01, method]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 || reply[1] != method {
        return Err(SpoolError::Nntp(format!(
            "SOCKS5 proxy rejected auth method (got {:#04x})",
            reply[1]
        )));
    }

    if with_auth {
        let username = proxy.username.as_deref().unwrap_or_default();
        let password = proxy.password.as_deref().unwrap_or_default();
        if username.len() > 255 || password.len() > 255 {
            return Err(SpoolError::Nntp("SOCKS5 credentials too long".into()));
        }
        let mut msg = Vec::with_capacity(3 + username.len() + password.len());
        msg.push(0x01);
        msg.push(username.len() as u8);
        msg.extend_from_slice(username.as_bytes());
        msg.push(password.len() as u8);
        msg.extend_from_slice(password.as_bytes());
        stream.write_all(&msg).await?;

        let mut auth_reply = [0u8; 2];
        stream.read_exact(&mut auth_reply).await?;
        if auth_reply[1] != 0x00 {
            return Err(SpoolError::Nntp("SOCKS5 authentication failed".into()));
        }
    }

    if host.len() > 255 {
        return Err(SpoolError::Nntp("SOCKS5 target hostname too long".into()));
    }
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(SpoolError::Nntp(format!(
            "SOCKS5 connect failed (reply {:#04x})",
            head[1]
        )));
    }
    // Drain the bound address, which varies by address type.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(SpoolError::Nntp(format!(
                "SOCKS5 unknown address type {:#04x}",
                other
            )))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn proxied_provider(proxy_port: u16) -> ProviderConfig {
        ProviderConfig {
            name: "test".into(),
            host: "news.example.com".into(),
            port: 119,
            ssl: false,
            username: None,
            password: None,
            max_conns: 1,
            priority: 0,
            max_art_size: 0,
            posting: false,
            enabled: None,
            proxy: Some(ProxyConfig {
                enabled: true,
                host: "127.0.0.1".into(),
                port: proxy_port,
                username: None,
                password: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_socks5_handshake_sent_correctly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut target = vec![0u8; head[4] as usize + 2];
            sock.read_exact(&mut target).await.unwrap();
            let host = String::from_utf8(target[..head[4] as usize].to_vec()).unwrap();
            assert_eq!(host, "news.example.com");

            // Success reply with an IPv4 bound address.
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let provider = proxied_provider(port);
        let stream = dial(&provider, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(stream, ConnStream::Plain(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_credentials_without_tls_refused() {
        let mut provider = proxied_provider(1);
        provider.proxy = None;
        provider.username = Some("user".into());
        provider.password = Some("pass".into());
        provider.ssl = false;
        assert!(dial(&provider, Duration::from_secs(1)).await.is_err());
    }
}
