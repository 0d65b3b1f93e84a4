/// Client bookkeeping per network, and reconnection of clients that drop.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::broker::NickResolver;
use super::client::{BridgedClient, ClientContext, ClientEvent, ClientIdentity, ClientStatus};
use super::message::irc_lowercase;
use crate::config::NetworkConfig;
use crate::error::ClientError;
use crate::util::queue_pool::QueuePool;

#[derive(Default)]
struct NetworkClients {
    /// folded nick → connected client
    nicks: HashMap<String, Arc<BridgedClient>>,
    /// folded desired nick → client not yet connected
    pending: HashMap<String, Arc<BridgedClient>>,
    user_ids: HashMap<String, Arc<BridgedClient>>,
    bot: Option<Arc<BridgedClient>>,
    count: usize,
}

#[derive(Default)]
pub struct ClientRegistry {
    networks: Mutex<HashMap<String, NetworkClients>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, NetworkClients>> {
        self.networks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Track a client before it connects, so its nick already counts as ours.
    pub fn insert(&self, client: &Arc<BridgedClient>) {
        let mut networks = self.lock();
        let net = networks.entry(client.domain().to_owned()).or_default();
        net.pending.insert(irc_lowercase(&client.nick()), client.clone());
        if let Some(user_id) = client.user_id() {
            net.user_ids.insert(user_id.to_owned(), client.clone());
        }
        if client.is_bot() {
            net.bot = Some(client.clone());
        }
        net.count += 1;
    }

    pub fn on_connected(&self, client: &Arc<BridgedClient>) {
        let nick = client.nick();
        let mut networks = self.lock();
        let net = networks.entry(client.domain().to_owned()).or_default();
        net.pending.remove(&irc_lowercase(client.desired_nick()));
        net.pending.remove(&irc_lowercase(&nick));
        if nick != client.desired_nick() {
            debug!(domain = %client.domain(), %nick, desired = client.desired_nick(), "registry: connected with a different nick");
        }
        net.nicks.insert(irc_lowercase(&nick), client.clone());
    }

    pub fn on_nick_change(&self, client: &Arc<BridgedClient>, old: &str, new: &str) {
        let mut networks = self.lock();
        let net = networks.entry(client.domain().to_owned()).or_default();
        if net.nicks.get(&irc_lowercase(old)).is_some_and(|c| Arc::ptr_eq(c, client)) {
            net.nicks.remove(&irc_lowercase(old));
        }
        net.nicks.insert(irc_lowercase(new), client.clone());
    }

    pub fn remove(&self, client: &Arc<BridgedClient>) {
        let mut networks = self.lock();
        let Some(net) = networks.get_mut(client.domain()) else { return };
        let mine = |c: &Arc<BridgedClient>| Arc::ptr_eq(c, client);
        let present = net
            .nicks
            .values()
            .chain(net.pending.values())
            .chain(net.user_ids.values())
            .chain(net.bot.iter())
            .any(mine);
        if !present {
            return;
        }
        net.nicks.retain(|_, c| !mine(c));
        net.pending.retain(|_, c| !mine(c));
        net.user_ids.retain(|_, c| !mine(c));
        if net.bot.as_ref().is_some_and(mine) {
            net.bot = None;
        }
        net.count = net.count.saturating_sub(1);
    }

    pub fn bot(&self, domain: &str) -> Option<Arc<BridgedClient>> {
        self.lock().get(domain)?.bot.clone()
    }

    pub fn by_nick(&self, domain: &str, nick: &str) -> Option<Arc<BridgedClient>> {
        let networks = self.lock();
        let net = networks.get(domain)?;
        let folded = irc_lowercase(nick);
        if let Some(bot) = &net.bot {
            if irc_lowercase(&bot.nick()) == folded && !bot.is_dead() {
                return Some(bot.clone());
            }
        }
        net.nicks.get(&folded).filter(|c| !c.is_dead()).cloned()
    }

    pub fn by_user_id(&self, domain: &str, user_id: &str) -> Option<Arc<BridgedClient>> {
        self.lock()
            .get(domain)?
            .user_ids
            .get(user_id)
            .filter(|c| !c.is_dead())
            .cloned()
    }

    /// Every live client for `user_id`, across networks.
    pub fn clients_for_user(&self, user_id: &str) -> Vec<Arc<BridgedClient>> {
        self.lock()
            .values()
            .filter_map(|net| net.user_ids.get(user_id))
            .filter(|c| !c.is_dead())
            .cloned()
            .collect()
    }

    pub fn count(&self, domain: &str) -> usize {
        self.lock().get(domain).map_or(0, |n| n.count)
    }

    pub fn all(&self) -> Vec<Arc<BridgedClient>> {
        let networks = self.lock();
        let mut out: Vec<Arc<BridgedClient>> = Vec::new();
        for net in networks.values() {
            let clients = net
                .nicks
                .values()
                .chain(net.pending.values())
                .chain(net.user_ids.values())
                .chain(net.bot.iter());
            for client in clients {
                if !out.iter().any(|c| Arc::ptr_eq(c, client)) {
                    out.push(client.clone());
                }
            }
        }
        out
    }
}

impl NickResolver for ClientRegistry {
    fn is_live(&self, domain: &str, nick: &str) -> bool {
        self.by_nick(domain, nick).is_some()
    }

    fn nick_is_virtual(&self, domain: &str, nick: &str) -> bool {
        let folded = irc_lowercase(nick);
        let networks = self.lock();
        let Some(net) = networks.get(domain) else { return false };
        net.nicks.contains_key(&folded)
            || net.pending.contains_key(&folded)
            || net.bot.as_ref().is_some_and(|b| irc_lowercase(&b.nick()) == folded)
    }
}

struct ReconnectItem {
    client: Arc<BridgedClient>,
    channels: Vec<String>,
}

/// Creates clients and brings back the ones that drop unexpectedly.
pub struct ClientPool {
    registry: Arc<ClientRegistry>,
    ctx: Arc<ClientContext>,
    networks: HashMap<String, Arc<NetworkConfig>>,
    reconnect_queues: Mutex<HashMap<String, Arc<QueuePool<ReconnectItem, ()>>>>,
    me: Weak<ClientPool>,
}

impl ClientPool {
    pub fn new(
        registry: Arc<ClientRegistry>,
        ctx: Arc<ClientContext>,
        networks: impl IntoIterator<Item = NetworkConfig>,
    ) -> Arc<Self> {
        let networks = networks
            .into_iter()
            .map(|n| (n.domain.clone(), Arc::new(n)))
            .collect();
        Arc::new_cyclic(|me| Self {
            registry,
            ctx,
            networks,
            reconnect_queues: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn network(&self, domain: &str) -> Option<&Arc<NetworkConfig>> {
        self.networks.get(domain)
    }

    /// Build and register a client. It is not connected yet.
    pub fn create_client(&self, domain: &str, identity: ClientIdentity) -> Result<Arc<BridgedClient>, ClientError> {
        let network = self
            .networks
            .get(domain)
            .ok_or_else(|| ClientError::UnknownNetwork(domain.to_owned()))?
            .clone();
        let client = BridgedClient::new(network, identity, self.ctx.clone());
        self.registry.insert(&client);
        tokio::spawn(listen(self.me.clone(), client.clone(), client.subscribe()));
        debug!(%domain, nick = %client.nick(), id = client.id(), "pool: created client");
        Ok(client)
    }

    /// Items waiting for a free reconnect lane on `domain`.
    pub fn waiting_reconnects(&self, domain: &str) -> usize {
        lock(&self.reconnect_queues).get(domain).map_or(0, |q| q.waiting_items())
    }

    fn reconnect_queue(&self, network: &NetworkConfig) -> Option<Arc<QueuePool<ReconnectItem, ()>>> {
        if network.concurrent_reconnect_limit == 0 {
            return None;
        }
        let mut queues = lock(&self.reconnect_queues);
        let queue = queues.entry(network.domain.clone()).or_insert_with(|| {
            Arc::new(QueuePool::new(network.concurrent_reconnect_limit, |item: ReconnectItem| {
                reconnect_client(item).boxed()
            }))
        });
        Some(queue.clone())
    }

    fn on_client_disconnected(&self, client: &Arc<BridgedClient>) {
        self.registry.remove(client);
        if client.explicit_disconnect() || client.is_disabled() || client.status() == ClientStatus::Killed {
            debug!(domain = %client.domain(), nick = %client.nick(), "pool: explicit disconnect, not reconnecting");
            return;
        }

        let replacement = match self.create_client(client.domain(), client.identity()) {
            Ok(c) => c,
            Err(e) => {
                error!(domain = %client.domain(), nick = %client.nick(), "pool: cannot recreate client: {e}");
                return;
            }
        };
        let channels = client.chan_list();
        if channels.is_empty() && !client.is_bot() {
            info!(domain = %client.domain(), id = replacement.id(), nick = %replacement.nick(), "pool: dropping client, not joined to any channels");
            self.registry.remove(&replacement);
            return;
        }

        let item = ReconnectItem {
            client: replacement.clone(),
            channels,
        };
        match self.reconnect_queue(client.network()) {
            None => {
                tokio::spawn(reconnect_client(item));
            }
            Some(queue) => {
                if let Err(e) = queue.enqueue(replacement.id().to_owned(), item, None) {
                    error!(domain = %client.domain(), "pool: failed to queue reconnect: {e}");
                } else {
                    info!(domain = %client.domain(), nick = %replacement.nick(), waiting = queue.waiting_items(), "pool: queued reconnect");
                }
            }
        }
    }

    /// Kill every client and drop queued reconnects.
    pub fn kill_all(&self) {
        for queue in lock(&self.reconnect_queues).values() {
            queue.kill_all();
        }
        let clients = self.registry.all();
        info!(count = clients.len(), "pool: killing all clients");
        for client in clients {
            client.kill(Some("Bridge shutting down"));
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn reconnect_client(item: ReconnectItem) {
    let ReconnectItem { client, channels } = item;
    if let Err(e) = client.reconnect(&channels).await {
        error!(domain = %client.domain(), nick = %client.nick(), "pool: failed to reconnect: {e}");
    }
}

async fn listen(pool: Weak<ClientPool>, client: Arc<BridgedClient>, mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(domain = %client.domain(), skipped = n, "pool: client listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(pool) = pool.upgrade() else { break };
        match event {
            ClientEvent::Connected { .. } => pool.registry.on_connected(&client),
            ClientEvent::NickChanged { old, new } => pool.registry.on_nick_change(&client, &old, &new),
            ClientEvent::JoinError { channel, reply } => {
                info!(domain = %client.domain(), nick = %client.nick(), %channel, %reply, "pool: join error");
            }
            ClientEvent::Disconnected { .. } => {
                pool.on_client_disconnected(&client);
                break;
            }
        }
    }
}
