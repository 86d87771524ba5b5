use super::session::{SessionContext, SmtpSession};
use crate::config::SmtpConfig;
use crate::extension::ExtensionHost;
use crate::message::MessageManager;
use crate::metrics::{Metrics, Protocol};
use crate::net::{accept_loop, bind};
use crate::security::TlsConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, Instrument};

pub struct SmtpServer {
    ctx: Arc<SessionContext>,
    sessions: TaskTracker,
}

impl SmtpServer {
    pub fn new(
        config: SmtpConfig,
        manager: Arc<MessageManager>,
        extensions: Arc<ExtensionHost>,
        tls: Option<TlsConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ctx: Arc::new(SessionContext {
                config,
                manager,
                extensions,
                tls: tls.map(|tls| tls.acceptor()),
                metrics,
            }),
            sessions: TaskTracker::new(),
        }
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        bind("smtp", &self.ctx.config.listen_addr).await
    }

    /// Accepts connections until `cancel` fires. Sessions already running
    /// are left to finish; see [`drain`](Self::drain).
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) {
        let ctx = Arc::clone(&self.ctx);
        let mut next_id: u64 = 0;

        accept_loop("smtp", listener, cancel, self.sessions.clone(), |socket, peer: SocketAddr| {
            next_id += 1;
            let span = info_span!("smtp", session = next_id, peer = %peer);
            let connection = ctx.metrics.connected(Protocol::Smtp);
            let session = SmtpSession::new(Arc::clone(&ctx), socket, peer);
            async move {
                session.run().await;
                drop(connection);
            }
            .instrument(span)
        })
        .await;
    }

    /// Number of sessions still running
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Blocks until every session has finished. Call after `serve` returned.
    pub async fn drain(&self) {
        self.sessions.close();
        self.sessions.wait().await;
        debug!("SMTP connections have drained");
    }
}
