// ABOUTME: Wires the store, bus, router, and scheduler into one running process.
// ABOUTME: Outbound replies go to a logging sink that stands in for real channel adapters.

use anyhow::Result;
use async_trait::async_trait;
use spool_core::bus::{MessageBus, OutboundHandler};
use spool_core::config::Config;
use spool_core::db::Database;
use spool_core::event::OutboundEvent;
use spool_core::queue::QueueStore;
use spool_core::router::ConversationRouter;
use spool_core::scheduler::Scheduler;
use spool_core::tasks::TaskStore;
use spool_core::time::preview;
use spool_core::EchoAgent;
use std::sync::Arc;
use std::time::Duration;

/// Outbound consumer that records each delivery in the log
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl OutboundHandler for LoggingSink {
    async fn handle_outbound(&self, event: OutboundEvent) -> Result<()> {
        tracing::info!(
            channel = %event.channel,
            chat_id = %event.chat_id,
            reply_to = ?event.reply_to,
            content = %preview(&event.content, 200),
            "Outbound delivered"
        );
        Ok(())
    }
}

/// Every component of a running instance, sharing one database
pub struct Runtime {
    pub config: Config,
    pub db: Database,
    pub bus: MessageBus,
    pub router: Arc<ConversationRouter>,
    pub scheduler: Arc<Scheduler>,
}

impl Runtime {
    /// Open the workspace database and build the components without starting any loops
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open_in_dir(&config.workspace.path)?;
        let bus = MessageBus::new(QueueStore::new(db.connection()), config.bus.clone());
        let router = Arc::new(ConversationRouter::new(
            bus.clone(),
            db.connection(),
            Arc::new(EchoAgent),
            &config.router,
        ));
        let scheduler = Arc::new(Scheduler::new(
            TaskStore::new(db.connection()),
            bus.clone(),
            config.scheduler.clone(),
        )?);

        bus.on_inbound(router.clone());
        bus.on_outbound(Arc::new(LoggingSink));

        Ok(Self {
            config,
            db,
            bus,
            router,
            scheduler,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.bus.start().await?;
        self.scheduler.start()?;
        Ok(())
    }

    /// Stop the scheduler first so no new work lands, then the bus
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.bus.stop().await;
    }

    /// Run until Ctrl-C, evicting idle per-conversation state along the way
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        self.start().await?;
        tracing::info!(
            workspace = %self.config.workspace.path,
            "Spool running, press Ctrl-C to stop"
        );

        let sweep_every = self
            .config
            .router
            .idle_evict_after()
            .max(Duration::from_secs(1));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.tick().await;

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    }
                    break;
                }
                _ = sweep.tick() => {
                    let evicted = self.router.evict_idle();
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted idle conversations");
                    }
                }
            }
        }

        tracing::info!("Shutting down");
        self.shutdown().await;
        Ok(())
    }
}
