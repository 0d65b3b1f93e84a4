/// Startup wiring: one of every registry, shared by reference.
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::ClientError;
use crate::irc::broker::EventBroker;
use crate::irc::claims::ClaimTable;
use crate::irc::client::{BridgedClient, ClientContext, ClientIdentity};
use crate::irc::pool::{ClientPool, ClientRegistry};
use crate::irc::scheduler::SchedulerRegistry;
use crate::irc::transport::Connector;

use self::handler::RoomHandler;
use self::quit_debouncer::QuitDebouncer;

pub mod handler;
pub mod quit_debouncer;

pub struct Bridge {
    config: BridgeConfig,
    claims: Arc<ClaimTable>,
    scheduler: Arc<SchedulerRegistry>,
    debouncer: Arc<QuitDebouncer>,
    broker: Arc<EventBroker>,
    pool: Arc<ClientPool>,
    claim_cleaner: JoinHandle<()>,
}

impl Bridge {
    /// Must be called from within a tokio runtime.
    pub fn new(config: BridgeConfig, handler: Arc<dyn RoomHandler>, connector: Arc<dyn Connector>) -> Self {
        let claims = Arc::new(ClaimTable::new());
        let scheduler = Arc::new(SchedulerRegistry::new());
        let debouncer = Arc::new(QuitDebouncer::new(handler.clone()));
        let registry = Arc::new(ClientRegistry::new());
        let broker = Arc::new(EventBroker::new(
            handler,
            claims.clone(),
            debouncer.clone(),
            registry.clone(),
        ));
        let ctx = Arc::new(ClientContext {
            homeserver_domain: config.homeserver_domain.clone(),
            connector,
            scheduler: scheduler.clone(),
            broker: broker.clone(),
        });
        let pool = ClientPool::new(registry, ctx, config.networks.iter().cloned());
        let claim_cleaner = claims.spawn_cleaner();

        info!(
            homeserver = %config.homeserver_domain,
            networks = config.networks.len(),
            "bridge: initialised"
        );
        Self {
            config,
            claims,
            scheduler,
            debouncer,
            broker,
            pool,
            claim_cleaner,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn claims(&self) -> &Arc<ClaimTable> {
        &self.claims
    }

    pub fn scheduler(&self) -> &Arc<SchedulerRegistry> {
        &self.scheduler
    }

    pub fn debouncer(&self) -> &Arc<QuitDebouncer> {
        &self.debouncer
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        self.pool.registry()
    }

    /// Create and connect the bot for `domain`.
    pub async fn connect_bot(&self, domain: &str) -> Result<Arc<BridgedClient>, ClientError> {
        let network = self
            .pool
            .network(domain)
            .ok_or_else(|| ClientError::UnknownNetwork(domain.to_owned()))?;
        let identity = ClientIdentity {
            nick: network.bot.nick.clone(),
            is_bot: true,
            ..ClientIdentity::default()
        };
        let bot = self.pool.create_client(domain, identity)?;
        bot.connect().await?;
        Ok(bot)
    }

    /// Create and connect a client for a bridged user.
    pub async fn connect_user(
        &self,
        domain: &str,
        identity: ClientIdentity,
    ) -> Result<Arc<BridgedClient>, ClientError> {
        if let Some(user_id) = identity.user_id.as_deref() {
            if let Some(existing) = self.registry().by_user_id(domain, user_id) {
                return Ok(existing);
            }
        }
        let client = self.pool.create_client(domain, identity)?;
        client.connect().await?;
        Ok(client)
    }

    /// Kill every client and stop background work.
    pub fn shutdown(&self) {
        info!("bridge: shutting down");
        self.pool.kill_all();
        self.scheduler.kill_all();
        self.claim_cleaner.abort();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;

    use async_trait::async_trait;

    use super::*;
    use crate::bridge::handler::LoggingHandler;
    use crate::irc::transport::{ConnectTarget, IrcStream};

    pub struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _: &ConnectTarget) -> io::Result<IrcStream> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    /// A client context whose connections never succeed.
    pub fn context() -> (Arc<ClientContext>, Arc<ClientRegistry>) {
        let handler: Arc<dyn RoomHandler> = Arc::new(LoggingHandler);
        let registry = Arc::new(ClientRegistry::new());
        let broker = Arc::new(EventBroker::new(
            handler.clone(),
            Arc::new(ClaimTable::new()),
            Arc::new(QuitDebouncer::new(handler)),
            registry.clone(),
        ));
        let ctx = Arc::new(ClientContext {
            homeserver_domain: "localhost".into(),
            connector: Arc::new(RefusingConnector),
            scheduler: Arc::new(SchedulerRegistry::new()),
            broker,
        });
        (ctx, registry)
    }
}
