/// One bridged identity on one network.
///
/// A `BridgedClient` outlives the connections it makes: each `connect`
/// builds a fresh [`ConnectionInstance`], and the client tracks the desired
/// channel list, nick and idle timer across them. Status changes are
/// published on a `watch` channel so callers can wait for a connection
/// that is still being set up.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use futures::future::{BoxFuture, FutureExt, Shared};
use rand::distributions::{Alphanumeric, DistString};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::EventBroker;
use super::connection::{ConnectOptions, ConnectionEvent, ConnectionInstance, DisconnectReason};
use super::message::{irc_lowercase, Message};
use super::nick::get_valid_nick;
use super::reply::ErrorReply;
use super::scheduler::SchedulerRegistry;
use super::transport::Connector;
use crate::bridge::handler::{ActionKind, IrcAction};
use crate::config::NetworkConfig;
use crate::error::{ClientError, JoinError, NickError};

const EVENT_CAPACITY: usize = 256;
const WHOIS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Created,
    Connecting,
    Connected,
    Dead,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { nick: String },
    Disconnected { reason: DisconnectReason },
    NickChanged { old: String, new: String },
    JoinError { channel: String, reply: ErrorReply },
}

/// Who the client is on the wire.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub nick: String,
    /// The bridged user on the other side; `None` for the bot.
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub password: Option<String>,
    pub local_address: Option<IpAddr>,
    pub is_bot: bool,
    /// The user opted out of a presence on this network.
    pub disabled: bool,
}

/// Shared collaborators every client needs.
pub struct ClientContext {
    pub homeserver_domain: String,
    pub connector: Arc<dyn Connector>,
    pub scheduler: Arc<SchedulerRegistry>,
    pub broker: Arc<EventBroker>,
}

type JoinFuture = Shared<BoxFuture<'static, Result<String, JoinError>>>;

struct ClientState {
    nick: String,
    conn: Option<Arc<ConnectionInstance>>,
    explicit_disconnect: bool,
    disconnect_reason: Option<DisconnectReason>,
    chan_list: BTreeSet<String>,
    last_action: Instant,
    idle_timer: Option<JoinHandle<()>>,
    /// Folded nicks with a WHOIS in flight; their 401s are not notices.
    whois_pending: HashSet<String>,
}

pub struct BridgedClient {
    id: String,
    identity: ClientIdentity,
    network: Arc<NetworkConfig>,
    ctx: Arc<ClientContext>,
    me: Weak<BridgedClient>,
    state: Mutex<ClientState>,
    status: watch::Sender<ClientStatus>,
    joins: Mutex<HashMap<String, JoinFuture>>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl fmt::Debug for BridgedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgedClient")
            .field("id", &self.id)
            .field("domain", &self.network.domain)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for BridgedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{}~{}",
            self.nick(),
            self.network.domain,
            self.id,
            self.identity.user_id.as_deref().unwrap_or("-")
        )
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BridgedClient {
    pub fn new(network: Arc<NetworkConfig>, identity: ClientIdentity, ctx: Arc<ClientContext>) -> Arc<Self> {
        let nick = get_valid_nick(&identity.nick, false, None).unwrap_or_else(|_| identity.nick.clone());
        let (status, _) = watch::channel(ClientStatus::Created);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            id: Alphanumeric.sample_string(&mut rand::thread_rng(), 12),
            identity,
            network,
            ctx,
            me: me.clone(),
            state: Mutex::new(ClientState {
                nick,
                conn: None,
                explicit_disconnect: false,
                disconnect_reason: None,
                chan_list: BTreeSet::new(),
                last_action: Instant::now(),
                idle_timer: None,
                whois_pending: HashSet::new(),
            }),
            status,
            joins: Mutex::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn domain(&self) -> &str {
        &self.network.domain
    }

    pub fn network(&self) -> &Arc<NetworkConfig> {
        &self.network
    }

    pub fn nick(&self) -> String {
        self.lock().nick.clone()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.user_id.as_deref()
    }

    pub fn is_bot(&self) -> bool {
        self.identity.is_bot
    }

    pub fn is_disabled(&self) -> bool {
        self.identity.disabled
    }

    /// The identity to reconnect with: same user, current nick.
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            nick: self.nick(),
            ..self.identity.clone()
        }
    }

    /// The nick the client was created with, before any server changes.
    pub fn desired_nick(&self) -> &str {
        &self.identity.nick
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.status(), ClientStatus::Dead | ClientStatus::Killed)
    }

    pub fn explicit_disconnect(&self) -> bool {
        self.lock().explicit_disconnect
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.lock().disconnect_reason
    }

    /// Channels this client has joined and wants to stay in.
    pub fn chan_list(&self) -> Vec<String> {
        self.lock().chan_list.iter().cloned().collect()
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        let folded = irc_lowercase(channel);
        self.lock().chan_list.iter().any(|c| irc_lowercase(c) == folded)
    }

    pub fn last_action(&self) -> Instant {
        self.lock().last_action
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The live connection, only while Connected.
    pub fn connection(&self) -> Option<Arc<ConnectionInstance>> {
        if self.status() != ClientStatus::Connected {
            return None;
        }
        self.lock().conn.clone()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Forward a connection notice without waiting on the handler.
    fn notify(&self, text: String, force: bool, reply: Option<ErrorReply>) {
        let Some(me) = self.me.upgrade() else { return };
        let broker = self.ctx.broker.clone();
        tokio::spawn(async move {
            broker.send_metadata(&me, &text, force, reply).await;
        });
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect, retrying until the server accepts us or the client is killed.
    pub async fn connect(&self) -> Result<Arc<ConnectionInstance>, ClientError> {
        if self.status() == ClientStatus::Killed {
            return Err(ClientError::Killed);
        }
        if self.identity.disabled {
            return Err(ClientError::Disabled);
        }
        self.status.send_replace(ClientStatus::Connecting);

        let nick = self.nick();
        let domain = self.network.domain.clone();
        info!(%domain, %nick, id = %self.id, "client: connecting");
        self.notify(format!("Connecting to the IRC network '{domain}' as {nick}..."), false, None);

        let realname = self
            .identity
            .realname
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.network.real_name.clone());
        let opts = ConnectOptions {
            nick: nick.clone(),
            username: self.identity.username.clone().unwrap_or_else(|| self.network.user_name.clone()),
            realname,
            password: self.identity.password.clone().or_else(|| self.network.password.clone()),
            local_address: self.identity.local_address,
            homeserver_domain: self.ctx.homeserver_domain.clone(),
        };

        let me = self.me.clone();
        let result = ConnectionInstance::create(
            self.network.clone(),
            opts,
            self.ctx.connector.clone(),
            self.ctx.scheduler.clone(),
            self.cancel.clone(),
            move |inst| {
                if let Some(client) = me.upgrade() {
                    client.on_connection_created(inst);
                }
            },
        )
        .await;

        let inst = match result {
            Ok(inst) => inst,
            Err(e) => {
                debug!(%domain, %nick, "client: failed to connect: {e}");
                let gave_up = {
                    let _st = self.lock();
                    let killed = self.status() == ClientStatus::Killed;
                    if !killed {
                        self.status.send_replace(ClientStatus::Dead);
                    }
                    !killed
                };
                // `kill` already reported a killed client.
                if gave_up {
                    self.end_unconnected(e.reason().unwrap_or(DisconnectReason::NetError));
                }
                return Err(e.into());
            }
        };

        let nick = {
            let mut st = self.lock();
            if self.status() == ClientStatus::Killed {
                return Err(ClientError::Killed);
            }
            if inst.is_dead() {
                return Err(ClientError::Dead);
            }
            st.nick = inst.nick();
            st.conn = Some(inst.clone());
            self.status.send_replace(ClientStatus::Connected);
            st.nick.clone()
        };
        info!(%domain, %nick, id = %self.id, "client: connected");
        self.emit(ClientEvent::Connected { nick: nick.clone() });
        self.keep_alive();
        self.notify(
            format!("You've been connected to the IRC network '{domain}' as {nick}."),
            false,
            None,
        );
        Ok(inst)
    }

    /// Connect again and rejoin `channels` one after another.
    pub async fn reconnect(self: &Arc<Self>, channels: &[String]) -> Result<(), ClientError> {
        self.connect().await?;
        info!(domain = %self.network.domain, nick = %self.nick(), count = channels.len(), "client: reconnected, rejoining channels");
        for channel in channels {
            if let Err(e) = self.join_channel(channel, None).await {
                error!(domain = %self.network.domain, nick = %self.nick(), %channel, "client: failed to rejoin: {e}");
            }
        }
        Ok(())
    }

    /// Drop the connection. `explicit` stops the pool from reconnecting.
    pub fn disconnect(&self, reason: DisconnectReason, text: Option<&str>, explicit: bool) {
        let conn = {
            let mut st = self.lock();
            st.explicit_disconnect = explicit;
            if self.status() != ClientStatus::Connected {
                return;
            }
            st.conn.clone()
        };
        if let Some(conn) = conn {
            conn.disconnect(reason, text);
        }
    }

    /// Stop for good: no further commands, no reconnects.
    pub fn kill(&self, text: Option<&str>) {
        let (conn, was_connected) = {
            let mut st = self.lock();
            let was_connected = self.status() == ClientStatus::Connected;
            st.explicit_disconnect = true;
            self.status.send_replace(ClientStatus::Killed);
            if let Some(timer) = st.idle_timer.take() {
                timer.abort();
            }
            (st.conn.clone(), was_connected)
        };
        info!(domain = %self.network.domain, nick = %self.nick(), "client: killed");
        self.cancel.cancel();
        if let Some(conn) = conn {
            conn.disconnect(DisconnectReason::Killed, text);
        }
        // Only a connected client hears back from its connection.
        if !was_connected {
            self.end_unconnected(DisconnectReason::Killed);
        }
    }

    /// Report the end of a client that never reached Connected, so owners
    /// can forget it. Such a client is never reconnected.
    fn end_unconnected(&self, reason: DisconnectReason) {
        {
            let mut st = self.lock();
            st.explicit_disconnect = true;
            st.disconnect_reason = Some(reason);
        }
        info!(domain = %self.network.domain, nick = %self.nick(), %reason, "client: gave up before connecting");
        self.emit(ClientEvent::Disconnected { reason });
    }

    /// Wait out a connect in progress.
    pub async fn wait_for_connected(&self) -> Result<Arc<ConnectionInstance>, ClientError> {
        let mut rx = self.status.subscribe();
        let status = *rx
            .wait_for(|s| !matches!(s, ClientStatus::Created | ClientStatus::Connecting))
            .await
            .map_err(|_| ClientError::Dead)?;
        match status {
            ClientStatus::Connected => self.connection().ok_or(ClientError::Dead),
            ClientStatus::Killed => Err(ClientError::Killed),
            _ => Err(ClientError::Dead),
        }
    }

    fn on_connection_created(&self, inst: &Arc<ConnectionInstance>) {
        self.lock().conn = Some(inst.clone());
        if self.status() == ClientStatus::Killed {
            inst.disconnect(DisconnectReason::Killed, None);
            return;
        }

        let me = self.me.clone();
        inst.set_on_disconnect(Box::new(move |reason| {
            if let Some(client) = me.upgrade() {
                client.on_disconnected(reason);
            }
        }));

        if let Some(me) = self.me.upgrade() {
            self.ctx.broker.add_hooks(me.clone(), inst);
            tokio::spawn(watch_connection(me, inst.subscribe()));
        }
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        {
            let mut st = self.lock();
            st.disconnect_reason = Some(reason);
            if reason == DisconnectReason::Banned {
                st.explicit_disconnect = true;
            }
            if let Some(timer) = st.idle_timer.take() {
                timer.abort();
            }
            if self.status() != ClientStatus::Killed {
                self.status.send_replace(ClientStatus::Dead);
            }
        }
        info!(domain = %self.network.domain, nick = %self.nick(), %reason, "client: disconnected");
        self.emit(ClientEvent::Disconnected { reason });
        self.notify(
            format!("Your connection to the IRC network '{}' has been lost.", self.network.domain),
            false,
            None,
        );
    }

    /// Note activity and restart the idle timer.
    fn keep_alive(&self) {
        let mut st = self.lock();
        st.last_action = Instant::now();
        if self.identity.is_bot || self.network.membership_sync_to_irc {
            return;
        }
        let Some(idle) = self.network.idle_timeout() else { return };
        if let Some(timer) = st.idle_timer.take() {
            timer.abort();
        }
        let me = self.me.clone();
        st.idle_timer = Some(tokio::spawn(async move {
            sleep(idle).await;
            if let Some(client) = me.upgrade() {
                info!(domain = %client.network.domain, nick = %client.nick(), "client: idle timeout has expired");
                let text = format!("Idle timeout reached: {}s", idle.as_secs());
                client.disconnect(DisconnectReason::Idle, Some(&text), true);
            }
        }));
    }

    // ── Nick ─────────────────────────────────────────────────────

    /// Change nick and wait for the server to confirm or refuse.
    pub async fn change_nick(&self, new_nick: &str, throw_on_invalid: bool) -> Result<String, NickError> {
        let conn = self.connection().ok_or(NickError::NotConnected)?;
        info!(domain = %self.network.domain, from = %self.nick(), to = new_nick, "client: changing nick");

        let max_len = conn.support().max_nick_len();
        let valid = get_valid_nick(new_nick, throw_on_invalid, Some(max_len))?;
        if valid == self.nick() {
            return Err(NickError::Unchanged(valid));
        }
        if valid != new_nick {
            return Err(NickError::NotCanonical(new_nick.to_owned()));
        }
        if self.check_nick_exists(&valid).await? {
            return Err(NickError::Taken {
                nick: valid,
                domain: self.network.domain.clone(),
            });
        }

        let mut events = conn.subscribe();
        if !conn.send(Message::new("NICK", [valid.as_str()])) {
            return Err(NickError::NotConnected);
        }

        let outcome = timeout(self.network.nick_timeout(), async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::NickChanged { old, new }) => {
                        return Ok(format!("Nick changed from '{old}' to '{new}'."));
                    }
                    Ok(ConnectionEvent::Error { reply, .. }) if reply.is_nick_failure() => {
                        error!(domain = %self.network.domain, nick = %valid, %reply, "client: nick change error");
                        return Err(NickError::Rejected(reply));
                    }
                    Ok(ConnectionEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(NickError::NotConnected);
                    }
                    _ => {}
                }
            }
        })
        .await;

        outcome.unwrap_or_else(|_| {
            error!(domain = %self.network.domain, nick = %valid, "client: timed out trying to change nick");
            Err(NickError::Timeout)
        })
    }

    /// Ask the server whether `nick` is in use, via WHOIS.
    pub async fn check_nick_exists(&self, nick: &str) -> Result<bool, NickError> {
        let conn = self.connection().ok_or(NickError::NotConnected)?;
        let folded = irc_lowercase(nick);
        let mut events = conn.subscribe();
        self.lock().whois_pending.insert(folded.clone());

        // A 401 leaves the pending entry for `watch_connection` to clear.
        let mut no_such_nick = false;
        let answer = async {
            if !conn.send(Message::new("WHOIS", [nick])) {
                return Err(NickError::NotConnected);
            }
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::RawLine(msg))
                        if matches!(msg.numeric(), Some(311 | 318)) && irc_lowercase(msg.param(1)) == folded =>
                    {
                        return Ok(msg.numeric() == Some(311));
                    }
                    Ok(ConnectionEvent::Error { reply: ErrorReply::NoSuchNick, message })
                        if irc_lowercase(message.param(1)) == folded =>
                    {
                        no_such_nick = true;
                        return Ok(false);
                    }
                    Ok(ConnectionEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(NickError::NotConnected);
                    }
                    _ => {}
                }
            }
        };
        let outcome = timeout(WHOIS_TIMEOUT, answer).await.unwrap_or_else(|_| {
            warn!(domain = %self.network.domain, %nick, "client: whois request timed out");
            Err(NickError::Timeout)
        });
        if !no_such_nick {
            self.lock().whois_pending.remove(&folded);
        }
        outcome
    }

    // ── Channels ─────────────────────────────────────────────────

    /// Join `channel`. Concurrent calls for the same channel share one
    /// wire JOIN and one outcome.
    pub async fn join_channel(self: &Arc<Self>, channel: &str, key: Option<&str>) -> Result<String, JoinError> {
        let folded = irc_lowercase(channel);
        let join = {
            let mut joins = lock(&self.joins);
            joins
                .entry(folded.clone())
                .or_insert_with(|| {
                    let client = self.clone();
                    let (channel, key) = (channel.to_owned(), key.map(str::to_owned));
                    async move {
                        let result = client.clone().join_with_retries(channel, key).await;
                        lock(&client.joins).remove(&folded);
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        join.await
    }

    async fn join_with_retries(self: Arc<Self>, channel: String, key: Option<String>) -> Result<String, JoinError> {
        let folded = irc_lowercase(&channel);
        let domain = self.network.domain.clone();
        let mut attempt: u32 = 1;

        loop {
            let conn = self.wait_for_connected().await.map_err(|_| JoinError::NotConnected)?;
            if !conn.support().is_channel(&channel) {
                return Ok(channel);
            }
            if conn.in_channel(&channel) {
                self.lock().chan_list.insert(channel.clone());
                return Ok(channel);
            }

            let key = key
                .clone()
                .or_else(|| self.network.channel_key(&channel).map(str::to_owned));
            let mut params = vec![channel.clone()];
            params.extend(key);

            let mut events = conn.subscribe();
            debug!(%domain, nick = %self.nick(), %channel, attempt, "client: joining channel");
            if !conn.send(Message::new("JOIN", params)) {
                return Err(JoinError::ConnectionLost { channel });
            }

            match timeout(self.network.join_timeout(), wait_for_join(&conn, &mut events, &folded, &channel)).await {
                Ok(Ok(())) => {
                    debug!(%domain, nick = %self.nick(), %channel, "client: joined channel");
                    self.lock().chan_list.insert(channel.clone());
                    return Ok(channel);
                }
                Ok(Err(e)) => {
                    if let JoinError::Rejected { reply, .. } = &e {
                        error!(%domain, nick = %self.nick(), %channel, %reply, "client: cannot track channel");
                        self.emit(ClientEvent::JoinError { channel: channel.clone(), reply: *reply });
                        self.notify(format!("Could not join {channel} on '{domain}': {reply}"), true, Some(*reply));
                    }
                    return Err(e);
                }
                Err(_) => {
                    if conn.in_channel(&channel) {
                        debug!(%domain, %channel, "client: join timed out but we are in the channel");
                        self.lock().chan_list.insert(channel.clone());
                        return Ok(channel);
                    }
                    if attempt >= self.network.join_attempts {
                        return Err(JoinError::AttemptsExhausted { channel, attempts: attempt });
                    }
                    warn!(%domain, nick = %self.nick(), %channel, attempt, "client: timed out joining, trying again");
                    attempt += 1;
                }
            }
        }
    }

    pub async fn leave_channel(&self, channel: &str, reason: Option<&str>) {
        let folded = irc_lowercase(channel);
        self.lock().chan_list.retain(|c| irc_lowercase(c) != folded);

        let Some(conn) = self.connection() else { return };
        if !conn.support().is_channel(channel) || !conn.in_channel(channel) {
            return;
        }
        debug!(domain = %self.network.domain, nick = %self.nick(), %channel, "client: leaving channel");
        let mut events = conn.subscribe();
        conn.send(Message::new("PART", [channel, reason.unwrap_or("User left")]));
        let parted = async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::ChannelParted { channel }) if irc_lowercase(&channel) == folded => break,
                    Ok(ConnectionEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => break,
                    _ => {}
                }
            }
        };
        let _ = timeout(self.network.join_timeout(), parted).await;
    }

    pub fn kick(&self, nick: &str, channel: &str, reason: &str) {
        let Some(conn) = self.connection() else { return };
        if !conn.support().is_channel(channel) || !conn.in_channel(channel) {
            return;
        }
        let reason = if reason.is_empty() { "User kicked" } else { reason };
        debug!(domain = %self.network.domain, %nick, %channel, "client: kicking");
        conn.send(Message::new("KICK", [channel, nick, reason]));
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Send text to a channel or nick, joining first where needed.
    pub async fn send_action(self: &Arc<Self>, target: &str, action: IrcAction) -> Result<(), ClientError> {
        self.keep_alive();
        let expires_at = action.ts.zip(self.network.expiry()).map(|(ts, ttl)| ts + ttl);

        if action.kind == ActionKind::Topic {
            self.wait_for_connected().await?;
            self.join_channel(target, None).await?;
            let conn = self.connection().ok_or(ClientError::NotConnecting)?;
            info!(domain = %self.network.domain, channel = target, "client: setting topic");
            conn.send(Message::new("TOPIC", [target, action.text.as_str()]));
            return Ok(());
        }

        self.wait_for_connected().await?;
        self.join_channel(target, None).await?;
        if expires_at.is_some_and(|at| SystemTime::now() > at) {
            error!(domain = %self.network.domain, target, "client: dropping event, too old");
            return Ok(());
        }
        let Some(conn) = self.connection() else { return Ok(()) };

        let lines = action
            .text
            .split('\n')
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty());
        for line in lines {
            let msg = match action.kind {
                ActionKind::Notice => Message::new("NOTICE", [target, line]),
                ActionKind::Emote => Message::ctcp("PRIVMSG", target, &format!("ACTION {line}")),
                _ => Message::new("PRIVMSG", [target, line]),
            };
            conn.send(msg);
        }
        Ok(())
    }
}

async fn wait_for_join(
    conn: &ConnectionInstance,
    events: &mut broadcast::Receiver<ConnectionEvent>,
    folded: &str,
    channel: &str,
) -> Result<(), JoinError> {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::ChannelJoined { channel: joined }) if irc_lowercase(&joined) == folded => {
                return Ok(());
            }
            Ok(ConnectionEvent::Error { reply, message })
                if reply.is_terminal_join_failure()
                    && message.params.iter().any(|p| irc_lowercase(p) == folded) =>
            {
                return Err(JoinError::Rejected {
                    channel: channel.to_owned(),
                    reply,
                });
            }
            Ok(ConnectionEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => {
                return Err(JoinError::ConnectionLost {
                    channel: channel.to_owned(),
                });
            }
            Err(broadcast::error::RecvError::Lagged(_)) if conn.in_channel(channel) => return Ok(()),
            _ => {}
        }
    }
}

/// Follow one connection for the client: track our nick and turn error
/// numerics into notices.
async fn watch_connection(client: Arc<BridgedClient>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::NickChanged { old, new }) => {
                client.lock().nick = new.clone();
                info!(domain = %client.network.domain, %old, %new, "client: nick changed");
                client.emit(ClientEvent::NickChanged { old, new });
            }
            Ok(ConnectionEvent::Error { reply, message }) => {
                if reply == ErrorReply::NoSuchNick && client.lock().whois_pending.remove(&irc_lowercase(message.param(1))) {
                    continue;
                }
                let params = serde_json::to_string(&message.params).unwrap_or_default();
                let text = format!("Received an error on {}: {reply}\n{params}", client.network.domain);
                client
                    .ctx
                    .broker
                    .send_metadata(&client, &text, reply.is_forced_notice(), Some(reply))
                    .await;
            }
            Ok(ConnectionEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(domain = %client.network.domain, nick = %client.nick(), skipped = n, "client: event listener lagged");
            }
            Ok(_) => {}
        }
    }
}
