use super::session::{Pop3Session, SessionContext};
use crate::config::Pop3Config;
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

pub struct Pop3Server {
    ctx: Arc<SessionContext>,
    sessions: TaskTracker,
}

impl Pop3Server {
    pub fn new(
        config: Pop3Config,
        manager: Arc<MessageManager>,
        tls: Option<TlsConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ctx: Arc::new(SessionContext {
                config,
                manager,
                tls: tls.map(|tls| tls.acceptor()),
                metrics,
            }),
            sessions: TaskTracker::new(),
        }
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        bind("pop3", &self.ctx.config.listen_addr).await
    }

    /// Accepts connections until `cancel` fires.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) {
        let ctx = Arc::clone(&self.ctx);
        let mut next_id: u64 = 0;

        accept_loop("pop3", listener, cancel, self.sessions.clone(), |socket, peer: SocketAddr| {
            next_id += 1;
            let span = info_span!("pop3", session = next_id, peer = %peer);
            let connection = ctx.metrics.connected(Protocol::Pop3);
            let session = Pop3Session::new(Arc::clone(&ctx), socket);
            async move {
                session.run().await;
                drop(connection);
            }
            .instrument(span)
        })
        .await;
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub async fn drain(&self) {
        self.sessions.close();
        self.sessions.wait().await;
        debug!("POP3 connections have drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MailboxNaming, SmtpConfig};
    use crate::extension::ExtensionHost;
    use crate::policy::AddressPolicy;
    use crate::storage::testing::delivery;
    use crate::storage::{MemoryStore, Store};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_serve_and_drain() {
        let extensions = Arc::new(ExtensionHost::new());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(0, 0, Arc::clone(&extensions)));
        store.add_message(delivery("pop", "one")).unwrap();
        let manager = Arc::new(MessageManager::new(
            Arc::new(AddressPolicy::new(MailboxNaming::Local, SmtpConfig::default())),
            Arc::clone(&store),
            extensions,
        ));
        let config = Pop3Config {
            listen_addr: "127.0.0.1:0".to_string(),
            timeout_secs: 5,
            ..Pop3Config::default()
        };
        let metrics = Arc::new(Metrics::new());
        let server = Arc::new(Pop3Server::new(config, manager, None, Arc::clone(&metrics)));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let serving = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve(listener, cancel).await })
        };

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("+OK"));

        client
            .get_mut()
            .write_all(b"USER pop\r\nPASS x\r\nDELE 1\r\n")
            .await
            .unwrap();
        for _ in 0..3 {
            line.clear();
            client.read_line(&mut line).await.unwrap();
        }
        assert_eq!(line, "+OK Deleted message 1\r\n");

        cancel.cancel();
        serving.await.unwrap();
        assert_eq!(server.active_sessions(), 1);
        let current = &metrics.pop3_connections.connects_current;
        assert_eq!(current.load(Ordering::Relaxed), 1);

        let drained = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drained.is_finished());

        client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();
        assert!(store.get_messages("pop").unwrap().is_empty());
        assert_eq!(current.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.pop3_deleted_total.load(Ordering::Relaxed), 1);
    }
}
