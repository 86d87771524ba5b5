//! Service lifecycle
//!
//! [`Services`] owns every long-running part of the daemon and runs them
//! against a single [`CancellationToken`]. Cancelling it stops the accept
//! loops, the hub, the extension workers and the retention scanner; open
//! protocol sessions are left to finish and are waited for by
//! [`Services::drain`].

use crate::config::Config;
use crate::error::{MailError, Result};
use crate::extension::ExtensionHost;
use crate::hub::{Hub, HubWorker};
use crate::message::MessageManager;
use crate::metrics::Metrics;
use crate::policy::AddressPolicy;
use crate::pop3::Pop3Server;
use crate::security::TlsConfig;
use crate::smtp::SmtpServer;
use crate::storage::{self, RetentionScanner, SequenceIdGenerator, Store};
use futures::FutureExt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Services {
    extensions: Arc<ExtensionHost>,
    store: Arc<dyn Store>,
    manager: Arc<MessageManager>,
    hub: Hub,
    hub_worker: Option<HubWorker>,
    smtp: Arc<SmtpServer>,
    pop3: Arc<Pop3Server>,
    retention: RetentionScanner,
    metrics: Arc<Metrics>,
    smtp_addr: Option<SocketAddr>,
    pop3_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    failures_tx: mpsc::UnboundedSender<MailError>,
    failures_rx: mpsc::UnboundedReceiver<MailError>,
}

impl Services {
    /// Wires every component from the configuration. Nothing runs yet.
    pub fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let extensions = Arc::new(ExtensionHost::new());
        let store = storage::from_config(
            &config.storage,
            Arc::new(SequenceIdGenerator::new()),
            Arc::clone(&extensions),
        )?;

        let (hub, hub_worker) = Hub::new(config.hub.history, config.hub.queue_capacity);
        hub.register(&extensions);

        let policy = Arc::new(AddressPolicy::new(config.mailbox_naming, config.smtp.clone()));
        let manager = Arc::new(MessageManager::new(
            policy,
            Arc::clone(&store),
            Arc::clone(&extensions),
        ));

        let metrics = Arc::new(Metrics::new());

        let smtp_tls = TlsConfig::from_config(
            config.smtp.tls_enabled,
            config.smtp.tls_cert_path.as_deref(),
            config.smtp.tls_key_path.as_deref(),
        )?;
        let pop3_tls = TlsConfig::from_config(
            config.pop3.tls_enabled,
            config.pop3.tls_cert_path.as_deref(),
            config.pop3.tls_key_path.as_deref(),
        )?;

        let smtp = Arc::new(SmtpServer::new(
            config.smtp.clone(),
            Arc::clone(&manager),
            Arc::clone(&extensions),
            smtp_tls,
            Arc::clone(&metrics),
        ));
        let pop3 = Arc::new(Pop3Server::new(
            config.pop3.clone(),
            Arc::clone(&manager),
            pop3_tls,
            Arc::clone(&metrics),
        ));

        let retention = RetentionScanner::new(
            Arc::clone(&store),
            config.storage.retention_period(),
            config.storage.retention_sleep(),
            Arc::clone(&metrics),
        );

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Ok(Self {
            extensions,
            store,
            manager,
            hub,
            hub_worker: Some(hub_worker),
            smtp,
            pop3,
            retention,
            metrics,
            smtp_addr: None,
            pop3_addr: None,
            tasks: Vec::new(),
            failures_tx,
            failures_rx,
        })
    }

    /// Binds both listeners and spawns every service.
    ///
    /// If a listener cannot be bound, `cancel` is cancelled and the error
    /// returned; nothing keeps running.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        let smtp_listener = match self.smtp.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind SMTP listener: {}", e);
                cancel.cancel();
                return Err(e.into());
            }
        };
        let pop3_listener = match self.pop3.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind POP3 listener: {}", e);
                cancel.cancel();
                return Err(e.into());
            }
        };
        self.smtp_addr = smtp_listener.local_addr().ok();
        self.pop3_addr = pop3_listener.local_addr().ok();

        self.tasks.extend(self.extensions.start(cancel.clone()));

        if let Some(worker) = self.hub_worker.take() {
            let task = self.supervise("hub", &cancel, worker.run(cancel.clone()));
            self.tasks.push(task);
        }

        let smtp = Arc::clone(&self.smtp);
        let token = cancel.clone();
        let task = self.supervise("smtp", &cancel, async move {
            smtp.serve(smtp_listener, token).await
        });
        self.tasks.push(task);

        let pop3 = Arc::clone(&self.pop3);
        let token = cancel.clone();
        let task = self.supervise("pop3", &cancel, async move {
            pop3.serve(pop3_listener, token).await
        });
        self.tasks.push(task);

        self.retention.start(cancel);

        info!(
            smtp = ?self.smtp_addr,
            pop3 = ?self.pop3_addr,
            "Services started"
        );
        Ok(())
    }

    /// Spawns a service task. If it panics the failure is reported through
    /// [`notify`](Self::notify) and `cancel` is cancelled.
    fn supervise<F>(&self, name: &'static str, cancel: &CancellationToken, service: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let failures = self.failures_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if AssertUnwindSafe(service).catch_unwind().await.is_err() {
                error!(service = name, "Service failed, shutting down");
                let _ = failures.send(MailError::Service(format!("{} panicked", name)));
                cancel.cancel();
            }
        })
    }

    /// Resolves with the first fatal service error.
    pub async fn notify(&mut self) -> Option<MailError> {
        self.failures_rx.recv().await
    }

    /// Waits for open sessions and background tasks to finish after the
    /// token passed to [`start`](Self::start) was cancelled. Gives up after
    /// `timeout` and returns false.
    pub async fn drain(&mut self, timeout: Duration) -> bool {
        info!(
            smtp_sessions = self.smtp.active_sessions(),
            pop3_sessions = self.pop3.active_sessions(),
            "Draining connections"
        );

        let drained = async {
            tokio::join!(self.smtp.drain(), self.pop3.drain());
            self.retention.join().await;
            for task in self.tasks.drain(..) {
                if let Err(e) = task.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => {
                info!("All services stopped");
                true
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Drain timed out, giving up");
                false
            }
        }
    }

    /// Address of the SMTP listener once started
    pub fn smtp_addr(&self) -> Option<SocketAddr> {
        self.smtp_addr
    }

    /// Address of the POP3 listener once started
    pub fn pop3_addr(&self) -> Option<SocketAddr> {
        self.pop3_addr
    }

    pub fn manager(&self) -> &Arc<MessageManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Subscribe here to follow stored and deleted messages
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn extensions(&self) -> &Arc<ExtensionHost> {
        &self.extensions
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
