/// One physical connection to an IRC network.
///
/// A [`ConnectionInstance`] is created fresh for every attempt and never
/// reused after it dies. Its task owns the framed stream and every timer
/// (connect deadline, ping-send, ping-receive timeout, outbound pacing);
/// everything else observes it through a [`ConnectionEvent`] broadcast.
/// All teardown goes through [`ConnectionInstance::disconnect`], which is
/// idempotent.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::FutureExt;
use futures::SinkExt;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::IrcCodec;
use super::isupport::ServerSupport;
use super::message::{irc_lowercase, Message};
use super::reply::ErrorReply;
use super::scheduler::SchedulerRegistry;
use super::transport::{ConnectTarget, Connector, IrcStream};
use crate::config::{ConnectionTiming, NetworkConfig};
use crate::error::ConnectError;

/// Fixed wait added to every later attempt once a server says we are throttled.
pub const THROTTLE_WAIT: Duration = Duration::from_secs(20);
/// Extra wait before retrying after a ban.
pub const BAN_COOLDOWN: Duration = Duration::from_secs(60 * 60);
const BASE_RETRY_MS: u64 = 1000;
const EVENT_CAPACITY: usize = 1024;
const QUIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const CONN_LIMIT_MESSAGES: &[&str] = &[
    "too many host connections",
    "no more connections allowed in your connection class",
    "this server is full",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    Throttled,
    IrcError,
    NetError,
    Timeout,
    RawError,
    TooManyConns,
    Banned,
    Killed,
    Idle,
    LimitReached,
    IWantToReconnect,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::IrcError => "irc_error",
            Self::NetError => "net_error",
            Self::Timeout => "timeout",
            Self::RawError => "raw_error",
            Self::TooManyConns => "toomanyconns",
            Self::Banned => "banned",
            Self::Killed => "killed",
            Self::Idle => "idle",
            Self::LimitReached => "limit_reached",
            Self::IWantToReconnect => "iwanttoreconnect",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the text of an `ERROR` line.
pub fn classify_error_line(text: Option<&str>) -> DisconnectReason {
    let Some(text) = text else {
        return DisconnectReason::RawError;
    };
    if text.contains("Closing Link:") && text.contains("(Bad user info)") {
        return DisconnectReason::Banned;
    }
    let lower = text.to_lowercase();
    if lower.contains("throttl") {
        DisconnectReason::Throttled
    } else if lower.contains("banned") || lower.contains("k-lined") {
        DisconnectReason::Banned
    } else if CONN_LIMIT_MESSAGES.iter().any(|m| lower.contains(m)) {
        DisconnectReason::TooManyConns
    } else {
        DisconnectReason::RawError
    }
}

/// Everything observable about a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Registration finished (001) under `nick`.
    Connected { nick: String },
    Disconnected { reason: DisconnectReason },
    /// A non-fatal error numeric.
    Error { reply: ErrorReply, message: Message },
    /// PONG to one of our `LAG` pings.
    LivenessProbe { token: String },
    /// Any other line, after roster bookkeeping.
    RawLine(Message),
    ChannelJoined { channel: String },
    ChannelParted { channel: String },
    /// Our own nick changed.
    NickChanged { old: String, new: String },
    /// Someone quit; `channels` are the ones we shared with them.
    UserQuit { nick: String, reason: String, channels: Vec<String>, line: Message },
    UserNick { old: String, new: String, channels: Vec<String>, line: Message },
    /// A completed NAMES listing: nick → membership symbols.
    Names { channel: String, names: BTreeMap<String, String> },
}

/// Per-attempt identity and registration details.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub password: Option<String>,
    pub local_address: Option<std::net::IpAddr>,
    pub homeserver_domain: String,
}

pub type DisconnectCallback = Box<dyn FnOnce(DisconnectReason) + Send>;

#[derive(Default)]
struct ChannelState {
    /// folded name → name as the server sent it
    joined: HashMap<String, String>,
    /// folded channel → nick → membership symbols
    roster: HashMap<String, HashMap<String, String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ConnectionInstance {
    domain: String,
    homeserver_domain: String,
    nick: RwLock<String>,
    state: Mutex<ConnectionState>,
    dead: AtomicBool,
    support: RwLock<ServerSupport>,
    channels: Mutex<ChannelState>,
    outbound: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    connected_tx: Mutex<Option<oneshot::Sender<Result<(), DisconnectReason>>>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    quit_text: Mutex<Option<String>>,
}

impl fmt::Debug for ConnectionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInstance")
            .field("domain", &self.domain)
            .field("nick", &self.nick())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionInstance {
    /// Build an instance, let `on_created` attach listeners, then start the
    /// task. The receiver settles once registration succeeds or the
    /// attempt dies.
    pub fn spawn(
        network: &NetworkConfig,
        opts: &ConnectOptions,
        connector: Arc<dyn Connector>,
        on_created: &(dyn Fn(&Arc<ConnectionInstance>) + Send + Sync),
    ) -> (Arc<Self>, oneshot::Receiver<Result<(), DisconnectReason>>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connected_tx, connected_rx) = oneshot::channel();

        let inst = Arc::new(Self {
            domain: network.domain.clone(),
            homeserver_domain: opts.homeserver_domain.clone(),
            nick: RwLock::new(opts.nick.clone()),
            state: Mutex::new(ConnectionState::Created),
            dead: AtomicBool::new(false),
            support: RwLock::new(ServerSupport::default()),
            channels: Mutex::new(ChannelState::default()),
            outbound,
            events,
            cancel: CancellationToken::new(),
            connected_tx: Mutex::new(Some(connected_tx)),
            on_disconnect: Mutex::new(None),
            quit_text: Mutex::new(None),
        });
        on_created(&inst);

        {
            let mut state = lock(&inst.state);
            if *state == ConnectionState::Created {
                *state = ConnectionState::Connecting;
            }
        }
        let target = ConnectTarget::for_network(network, opts.local_address);
        tokio::spawn(connection_task(
            inst.clone(),
            connector,
            target,
            opts.clone(),
            network.timing(),
            outbound_rx,
        ));
        (inst, connected_rx)
    }

    /// Connect with retries until success or `cancel` fires.
    ///
    /// With a reconnect interval configured each attempt waits its turn on
    /// the network's scheduler queue.
    pub async fn create<F>(
        network: Arc<NetworkConfig>,
        opts: ConnectOptions,
        connector: Arc<dyn Connector>,
        scheduler: Arc<SchedulerRegistry>,
        cancel: CancellationToken,
        on_created: F,
    ) -> Result<Arc<Self>, ConnectError>
    where
        F: Fn(&Arc<ConnectionInstance>) + Send + Sync + 'static,
    {
        let on_created = Arc::new(on_created);
        let scheduled = network.reconnect_interval().is_some();
        let mut attempts: u32 = 0;
        let mut throttle_wait = Duration::ZERO;
        let mut ban_wait = Duration::ZERO;

        loop {
            let attempt = {
                let (network, opts, connector, on_created) =
                    (network.clone(), opts.clone(), connector.clone(), on_created.clone());
                async move {
                    let (inst, connected) =
                        Self::spawn(&network, &opts, connector, &*on_created);
                    match connected.await {
                        Ok(Ok(())) => Ok(inst),
                        Ok(Err(reason)) => Err(ConnectError::Disconnected(reason)),
                        Err(_) => Err(ConnectError::Disconnected(DisconnectReason::NetError)),
                    }
                }
                .boxed()
            };

            let outcome = if scheduled {
                let queued =
                    scheduler.reschedule(&network, &opts.nick, throttle_wait + ban_wait, attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                    res = queued => res.map_err(ConnectError::Queue).and_then(|r| r),
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                    res = attempt => res,
                }
            };

            let err = match outcome {
                Ok(inst) => return Ok(inst),
                Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
                Err(e) => e,
            };

            attempts += 1;
            error!(
                domain = %network.domain,
                nick = %opts.nick,
                attempts,
                "connection: attempt failed ({err})"
            );

            ban_wait = Duration::ZERO;
            match err.reason() {
                Some(DisconnectReason::Throttled) => throttle_wait += THROTTLE_WAIT,
                Some(DisconnectReason::Banned) => {
                    error!(domain = %network.domain, nick = %opts.nick, "connection: banned from network");
                    ban_wait = BAN_COOLDOWN;
                }
                Some(DisconnectReason::TooManyConns) => {
                    warn!(domain = %network.domain, nick = %opts.nick, "connection: connection limit reached");
                }
                _ => {}
            }

            // Scheduled attempts carry the fixed waits on the queue item instead.
            let mut delay = retry_delay(attempts);
            if !scheduled {
                delay += throttle_wait + ban_wait;
            }
            info!(
                domain = %network.domain,
                nick = %opts.nick,
                delay_ms = delay.as_millis() as u64,
                attempts,
                "connection: retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn nick(&self) -> String {
        self.nick.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn support(&self) -> ServerSupport {
        self.support.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Run once, on the first disconnect after registration.
    pub fn set_on_disconnect(&self, callback: DisconnectCallback) {
        *lock(&self.on_disconnect) = Some(callback);
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        lock(&self.channels).joined.contains_key(&irc_lowercase(channel))
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.channels).joined.values().cloned().collect()
    }

    /// Membership symbols of `nick` in `channel`, if we've seen them there.
    pub fn membership(&self, channel: &str, nick: &str) -> Option<String> {
        lock(&self.channels)
            .roster
            .get(&irc_lowercase(channel))
            .and_then(|r| r.get(nick).cloned())
    }

    /// Queue a line behind the flood-protection pacing.
    pub fn send(&self, msg: Message) -> bool {
        if self.is_dead() {
            return false;
        }
        self.outbound.send(msg).is_ok()
    }

    /// Tear the connection down. Safe to call any number of times.
    pub fn disconnect(&self, reason: DisconnectReason, text: Option<&str>) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(domain = %self.domain, nick = %self.nick(), %reason, "connection: disconnecting");
        *lock(&self.quit_text) = Some(text.unwrap_or(reason.as_str()).to_owned());
        self.cancel.cancel();

        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Dead);
        if previous == ConnectionState::Connected {
            let callback = lock(&self.on_disconnect).take();
            if let Some(callback) = callback {
                callback(reason);
            }
        } else {
            let pending = lock(&self.connected_tx).take();
            if let Some(tx) = pending {
                let _ = tx.send(Err(reason));
            }
        }
        let _ = self.events.send(ConnectionEvent::Disconnected { reason });
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn mark_connected(&self, nick: &str) {
        if self.is_dead() {
            return;
        }
        if let Ok(mut n) = self.nick.write() {
            *n = nick.to_owned();
        }
        *lock(&self.state) = ConnectionState::Connected;
        if let Some(tx) = lock(&self.connected_tx).take() {
            let _ = tx.send(Ok(()));
        }
        self.emit(ConnectionEvent::Connected { nick: nick.to_owned() });
    }
}

/// Staggered retry jitter so mass disconnects don't reconnect in lockstep.
fn retry_delay(attempts: u32) -> Duration {
    let mut rng = rand::thread_rng();
    let base = rng.gen_range(0..BASE_RETRY_MS);
    let spread = rng.gen_range(0..=u64::from(attempts) * 1000);
    Duration::from_millis(base + spread)
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Per-task registration and NAMES bookkeeping.
struct Session {
    base_nick: String,
    nick_retries: u32,
    registered: bool,
    names: HashMap<String, BTreeMap<String, String>>,
}

async fn connection_task(
    inst: Arc<ConnectionInstance>,
    connector: Arc<dyn Connector>,
    target: ConnectTarget,
    opts: ConnectOptions,
    timing: ConnectionTiming,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    let domain = inst.domain.clone();
    let connect_deadline = Instant::now() + timing.connect_timeout;

    let stream: IrcStream = tokio::select! {
        _ = inst.cancel.cancelled() => return,
        _ = sleep_until(connect_deadline) => {
            error!(%domain, nick = %opts.nick, "connection: still not connected, killing");
            inst.disconnect(DisconnectReason::Timeout, None);
            return;
        }
        res = connector.connect(&target) => match res {
            Ok(s) => s,
            Err(e) => {
                warn!(%domain, host = %target.host, "connection: failed to connect: {e}");
                inst.disconnect(DisconnectReason::NetError, None);
                return;
            }
        },
    };
    debug!(%domain, host = %target.host, "connection: transport up, registering");

    let mut framed = Framed::new(stream, IrcCodec);
    let mut registration = Vec::new();
    if let Some(pass) = &opts.password {
        registration.push(Message::new("PASS", [pass.as_str()]));
    }
    registration.push(Message::new("NICK", [opts.nick.as_str()]));
    registration.push(Message::new(
        "USER",
        [opts.username.as_str(), "8", "*", opts.realname.as_str()],
    ));
    for msg in registration {
        if framed.send(msg).await.is_err() {
            inst.disconnect(DisconnectReason::NetError, None);
            return;
        }
    }

    let mut session = Session {
        base_nick: opts.nick.clone(),
        nick_retries: 0,
        registered: false,
        names: HashMap::new(),
    };
    let mut pending: VecDeque<Message> = VecDeque::new();
    let mut next_send_at = Instant::now();
    let ping_timeout = sleep(timing.ping_timeout);
    let ping_send = sleep(timing.ping_rate);
    let deadline = sleep_until(connect_deadline);
    tokio::pin!(ping_timeout, ping_send, deadline);

    loop {
        tokio::select! {
            biased;

            _ = inst.cancel.cancelled() => {
                let text = lock(&inst.quit_text).clone().unwrap_or_default();
                let quit = framed.send(Message::new("QUIT", [text]));
                let _ = tokio::time::timeout(QUIT_FLUSH_TIMEOUT, quit).await;
                break;
            }

            _ = &mut deadline, if !session.registered => {
                error!(%domain, nick = %opts.nick, "connection: registration timed out, killing");
                inst.disconnect(DisconnectReason::Timeout, None);
            }

            _ = &mut ping_timeout => {
                info!(%domain, nick = %inst.nick(), "connection: ping timeout, knifing connection");
                inst.disconnect(DisconnectReason::NetError, Some("Client-side ping timeout"));
            }

            _ = &mut ping_send, if session.registered => {
                let ping = Message::new("PING", [format!("LAG{}", now_millis())]);
                if framed.send(ping).await.is_err() {
                    inst.disconnect(DisconnectReason::NetError, None);
                    continue;
                }
                ping_timeout.as_mut().reset(Instant::now() + timing.ping_timeout);
                ping_send.as_mut().reset(Instant::now() + timing.ping_rate);
            }

            _ = sleep_until(next_send_at), if !pending.is_empty() => {
                if let Some(msg) = pending.pop_front() {
                    if framed.send(msg).await.is_err() {
                        inst.disconnect(DisconnectReason::NetError, None);
                        continue;
                    }
                    let now = Instant::now();
                    next_send_at = now + timing.flood_delay;
                    ping_timeout.as_mut().reset(now + timing.ping_timeout);
                    ping_send.as_mut().reset(now + timing.ping_rate);
                }
            }

            Some(msg) = outbound_rx.recv() => pending.push_back(msg),

            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(%domain, nick = %inst.nick(), "connection: stream error: {e}");
                        inst.disconnect(DisconnectReason::NetError, None);
                        continue;
                    }
                    None => {
                        info!(%domain, nick = %inst.nick(), "connection: remote closed connection");
                        inst.disconnect(DisconnectReason::NetError, None);
                        continue;
                    }
                };

                match msg.command.as_str() {
                    "PING" => {
                        ping_timeout.as_mut().reset(Instant::now() + timing.ping_timeout);
                        let pong = Message { prefix: None, command: "PONG".into(), params: msg.params };
                        if framed.send(pong).await.is_err() {
                            inst.disconnect(DisconnectReason::NetError, None);
                        }
                    }
                    "PONG" => {
                        ping_timeout.as_mut().reset(Instant::now() + timing.ping_timeout);
                        let token = msg.params.last().cloned().unwrap_or_default();
                        inst.emit(ConnectionEvent::LivenessProbe { token });
                    }
                    _ => {
                        if let Some(retry) = handle_line(&inst, &mut session, msg) {
                            if framed.send(retry).await.is_err() {
                                inst.disconnect(DisconnectReason::NetError, None);
                            }
                        }
                        if session.registered {
                            ping_send.as_mut().reset(Instant::now() + timing.ping_rate);
                        }
                    }
                }
            }
        }
    }
    debug!(%domain, nick = %inst.nick(), "connection: task finished");
}

/// Process one inbound line. Returns a line to write immediately (a
/// replacement NICK during registration).
fn handle_line(inst: &ConnectionInstance, session: &mut Session, msg: Message) -> Option<Message> {
    if inst.is_dead() {
        return None;
    }

    if let Some(code) = msg.numeric() {
        match code {
            1 => {
                session.registered = true;
                let nick = msg.param(0).to_owned();
                info!(domain = %inst.domain, %nick, "connection: registered");
                inst.mark_connected(&nick);
            }
            5 => {
                if let Ok(mut support) = inst.support.write() {
                    support.apply(&msg.params);
                }
            }
            353 => {
                let support = inst.support();
                let channel = irc_lowercase(msg.param(2));
                let entry = session.names.entry(channel).or_default();
                for name in msg.param(3).split_whitespace() {
                    let (nick, symbols) = support.split_membership(name);
                    entry.insert(nick.to_owned(), symbols.to_owned());
                }
            }
            366 => {
                let channel = msg.param(1).to_owned();
                let folded = irc_lowercase(&channel);
                let names = session.names.remove(&folded).unwrap_or_default();
                lock(&inst.channels)
                    .roster
                    .insert(folded, names.clone().into_iter().collect());
                inst.emit(ConnectionEvent::Names { channel, names });
            }
            432 | 433 | 436 | 437 if !session.registered => {
                session.nick_retries += 1;
                let max = inst.support().max_nick_len();
                let suffix = session.nick_retries.to_string();
                let keep = max.saturating_sub(suffix.len());
                let stem: String = session.base_nick.chars().take(keep).collect();
                let candidate = format!("{stem}{suffix}");
                warn!(domain = %inst.domain, %candidate, "connection: nick rejected during registration, retrying");
                if let Ok(mut n) = inst.nick.write() {
                    *n = candidate.clone();
                }
                return Some(Message::new("NICK", [candidate]));
            }
            _ => {
                if let Some(reply) = ErrorReply::from_numeric(code) {
                    handle_error_reply(inst, reply, msg);
                } else {
                    inst.emit(ConnectionEvent::RawLine(msg));
                }
            }
        }
        return None;
    }

    let me = inst.nick();
    let source = msg.source_nick().map(str::to_owned);
    let from_me = source.as_deref() == Some(me.as_str());

    match msg.command.as_str() {
        "ERROR" => {
            error!(domain = %inst.domain, nick = %me, line = %msg, "connection: server sent ERROR");
            let reason = classify_error_line(msg.params.first().map(String::as_str));
            if reason == DisconnectReason::Banned {
                error!(domain = %inst.domain, nick = %me, "connection: user was banned");
            }
            inst.disconnect(reason, None);
        }
        "JOIN" => {
            let channel = msg.param(0).to_owned();
            let folded = irc_lowercase(&channel);
            {
                let mut chans = lock(&inst.channels);
                if from_me {
                    chans.joined.insert(folded.clone(), channel.clone());
                    chans.roster.entry(folded).or_default();
                } else if let Some(nick) = &source {
                    chans.roster.entry(folded).or_default().insert(nick.clone(), String::new());
                }
            }
            if from_me {
                inst.emit(ConnectionEvent::ChannelJoined { channel });
            }
            inst.emit(ConnectionEvent::RawLine(msg));
        }
        "PART" | "KICK" => {
            let channel = msg.param(0).to_owned();
            let folded = irc_lowercase(&channel);
            let leaver = if msg.command == "KICK" {
                Some(msg.param(1).to_owned())
            } else {
                source.clone()
            };
            let we_left = leaver.as_deref() == Some(me.as_str());
            {
                let mut chans = lock(&inst.channels);
                if we_left {
                    chans.joined.remove(&folded);
                    chans.roster.remove(&folded);
                } else if let (Some(nick), Some(roster)) = (&leaver, chans.roster.get_mut(&folded)) {
                    roster.remove(nick);
                }
            }
            if we_left {
                inst.emit(ConnectionEvent::ChannelParted { channel });
            }
            inst.emit(ConnectionEvent::RawLine(msg));
        }
        "QUIT" => {
            let Some(nick) = source else { return None };
            let channels = {
                let mut chans = lock(&inst.channels);
                let ChannelState { joined, roster } = &mut *chans;
                roster
                    .iter_mut()
                    .filter_map(|(folded, members)| {
                        members.remove(&nick)?;
                        joined.get(folded).cloned()
                    })
                    .collect()
            };
            let reason = msg.param(0).to_owned();
            inst.emit(ConnectionEvent::UserQuit { nick, reason, channels, line: msg });
        }
        "NICK" => {
            let Some(old) = source else { return None };
            let new = msg.param(0).to_owned();
            let channels = {
                let mut chans = lock(&inst.channels);
                let ChannelState { joined, roster } = &mut *chans;
                roster
                    .iter_mut()
                    .filter_map(|(folded, members)| {
                        let symbols = members.remove(&old)?;
                        members.insert(new.clone(), symbols);
                        joined.get(folded).cloned()
                    })
                    .collect()
            };
            if from_me {
                if let Ok(mut n) = inst.nick.write() {
                    *n = new.clone();
                }
                info!(domain = %inst.domain, %old, %new, "connection: nick changed");
                inst.emit(ConnectionEvent::NickChanged { old: old.clone(), new: new.clone() });
            }
            inst.emit(ConnectionEvent::UserNick { old, new, channels, line: msg });
        }
        "MODE" => {
            let channel = msg.param(0);
            let support = inst.support();
            if support.is_channel(channel) {
                let folded = irc_lowercase(channel);
                let changes = support.parse_mode_changes(msg.param(1), msg.params.get(2..).unwrap_or(&[]));
                let mut chans = lock(&inst.channels);
                if let Some(roster) = chans.roster.get_mut(&folded) {
                    for change in changes {
                        let (Some(symbol), Some(nick)) = (support.prefix_for_mode(change.mode), change.arg) else {
                            continue;
                        };
                        if let Some(symbols) = roster.get_mut(&nick) {
                            if change.adding && !symbols.contains(symbol) {
                                symbols.push(symbol);
                            } else if !change.adding {
                                symbols.retain(|c| c != symbol);
                            }
                        }
                    }
                }
            }
            inst.emit(ConnectionEvent::RawLine(msg));
        }
        "PRIVMSG" if msg.ctcp_body() == Some("VERSION") => {
            if let Some(from) = &source {
                let version = format!(
                    "VERSION tidepool {} bridged via {}",
                    env!("CARGO_PKG_VERSION"),
                    inst.homeserver_domain
                );
                inst.send(Message::ctcp("NOTICE", from, &version));
            }
        }
        _ => inst.emit(ConnectionEvent::RawLine(msg)),
    }
    None
}

fn handle_error_reply(inst: &ConnectionInstance, reply: ErrorReply, message: Message) {
    if reply.is_fatal() {
        error!(domain = %inst.domain, nick = %inst.nick(), %reply, "connection: fatal error reply");
        let reason = if reply == ErrorReply::YoureBannedCreep {
            DisconnectReason::Banned
        } else {
            DisconnectReason::IrcError
        };
        inst.disconnect(reason, None);
        return;
    }
    debug!(domain = %inst.domain, nick = %inst.nick(), %reply, "connection: error reply");
    inst.emit(ConnectionEvent::Error { reply, message });
}
