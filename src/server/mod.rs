//! NNTP server: accepts reader and peer sessions on the plain and
//! implicit-TLS listeners and runs each as its own task.

pub mod session;

pub use session::{Session, SessionContext};

use std::sync::Arc;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::error::{Result, SpoolError};

pub struct NntpServer {
    ctx: Arc<SessionContext>,
}

impl NntpServer {
    pub fn new(ctx: Arc<SessionContext>) -> NntpServer {
        NntpServer { ctx }
    }

    /// Accept sessions until the shutdown signal flips, then stop accepting
    /// and let in-flight sessions drain.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.ctx.config.server.listen).await?;
        tracing::info!(addr = %self.ctx.config.server.listen, "nntp listener started");

        let tls = match (
            &self.ctx.config.server.tls_listen,
            &self.ctx.config.server.tls_cert,
            &self.ctx.config.server.tls_key,
        ) {
            (Some(addr), Some(cert), Some(key)) => {
                let acceptor = load_tls_acceptor(cert, key)?;
                let listener = TcpListener::bind(addr).await?;
                tracing::info!(addr = %addr, "nntp tls listener started");
                Some((listener, acceptor))
            }
            (Some(_), _, _) => {
                return Err(SpoolError::Config(
                    "tls_listen requires tls_cert and tls_key".into(),
                ))
            }
            _ => None,
        };

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let ctx = Arc::clone(&self.ctx);
                    sessions.spawn(async move {
                        Session::new(stream, ctx, addr.to_string()).run().await;
                    });
                }
                accepted = accept_tls(&tls), if tls.is_some() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let ctx = Arc::clone(&self.ctx);
                            sessions.spawn(async move {
                                Session::new(stream, ctx, remote).run().await;
                            });
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "tls accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                // Reap finished session tasks as they complete.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        tracing::info!(active = sessions.len(), "listener stopped, draining sessions");
        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if tokio::time::timeout(std::time::Duration::from_secs(30), drain)
            .await
            .is_err()
        {
            tracing::warn!("session drain timed out, aborting remaining sessions");
        }
        sessions.shutdown().await;
        Ok(())
    }
}

async fn accept_tls(
    tls: &Option<(TcpListener, TlsAcceptor)>,
) -> Result<(tokio_rustls::server::TlsStream<tokio::net::TcpStream>, String)> {
    let Some((listener, acceptor)) = tls else {
        // Guarded by the `if tls.is_some()` select arm.
        return std::future::pending().await;
    };
    let (tcp, addr) = listener.accept().await?;
    let stream = acceptor
        .accept(tcp)
        .await
        .map_err(|e| SpoolError::Nntp(format!("tls handshake failed: {}", e)))?;
    Ok((stream, addr.to_string()))
}

fn load_tls_acceptor(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| SpoolError::Config(format!("cannot read {}: {}", cert_path.display(), e)))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| SpoolError::Config(format!("bad certificate: {}", e)))?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| SpoolError::Config(format!("cannot read {}: {}", key_path.display(), e)))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SpoolError::Config(format!("tls config: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
