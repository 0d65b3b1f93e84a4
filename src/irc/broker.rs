/// Routing of wire events from many clients to one room handler.
///
/// Every bridged client on a network sees the same channel traffic. The
/// broker makes sure each distinct line reaches the [`RoomHandler`] once:
/// with the bot enabled only the bot reports shared events; otherwise the
/// first client to claim a line reports it and the rest stay quiet, unless
/// the claimant has since gone away, in which case the claim is stolen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::claims::{claim_key, names_key, ClaimTable};
use super::client::BridgedClient;
use super::connection::{ConnectionEvent, ConnectionInstance};
use super::isupport::ServerSupport;
use super::message::{irc_lowercase, Message};
use super::nick::get_valid_nick;
use super::reply::ErrorReply;
use crate::bridge::handler::{
    ActionKind, HandlerRejection, HandlerResult, IrcAction, IrcUser, JoinKind, PartKind, RoomHandler,
};
use crate::bridge::quit_debouncer::QuitDebouncer;

/// How long a channel message waits for the one before it.
const SOFT_ORDER_WAIT: Duration = Duration::from_secs(5);

/// Who is still around, per network.
pub trait NickResolver: Send + Sync {
    /// A live bridged client currently holds `nick`.
    fn is_live(&self, domain: &str, nick: &str) -> bool;
    /// `nick` belongs (or is about to belong) to one of our clients.
    fn nick_is_virtual(&self, domain: &str, nick: &str) -> bool;
}

struct NamesEntry {
    channel: String,
    nick: String,
    mode: Option<char>,
}

#[derive(Default)]
struct NamesState {
    entries: Vec<NamesEntry>,
    draining: bool,
}

/// NAMES entries waiting for the handler, per hooked connection. Only one
/// drainer runs at a time.
#[derive(Default)]
struct NamesBucket {
    state: Mutex<NamesState>,
}

impl NamesBucket {
    /// Queue `entries`. Returns true when the caller must start a drainer.
    fn push(&self, entries: impl IntoIterator<Item = NamesEntry>) -> bool {
        let mut st = lock(&self.state);
        st.entries.extend(entries);
        if st.draining || st.entries.is_empty() {
            return false;
        }
        st.draining = true;
        true
    }

    /// Next entry, or `None` once empty (which also ends the drain).
    fn pop(&self) -> Option<NamesEntry> {
        let mut st = lock(&self.state);
        let entry = st.entries.pop();
        if entry.is_none() {
            st.draining = false;
        }
        entry
    }
}

type OrderSlot = (u64, Shared<BoxFuture<'static, ()>>);

pub struct EventBroker {
    handler: Arc<dyn RoomHandler>,
    claims: Arc<ClaimTable>,
    debouncer: Arc<QuitDebouncer>,
    resolver: Arc<dyn NickResolver>,
    order: Mutex<HashMap<String, OrderSlot>>,
    order_seq: Mutex<u64>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn report(domain: &str, what: &str, result: HandlerResult) {
    match result {
        Ok(()) => {}
        Err(HandlerRejection::NotMapped) => trace!(domain, what, "broker: no room for event"),
        Err(rejection) => debug!(domain, what, %rejection, "broker: handler rejected event"),
    }
}

impl EventBroker {
    pub fn new(
        handler: Arc<dyn RoomHandler>,
        claims: Arc<ClaimTable>,
        debouncer: Arc<QuitDebouncer>,
        resolver: Arc<dyn NickResolver>,
    ) -> Self {
        Self {
            handler,
            claims,
            debouncer,
            resolver,
            order: Mutex::new(HashMap::new()),
            order_seq: Mutex::new(0),
        }
    }

    pub fn claims(&self) -> &Arc<ClaimTable> {
        &self.claims
    }

    /// Try to become the reporter of `line` for `domain`.
    pub fn attempt_claim(&self, domain: &str, nick: &str, line: &Message) -> bool {
        let Some(key) = claim_key(line) else {
            warn!(domain, nick, line = %line, "broker: dropping malformed line");
            return false;
        };
        self.claim(domain, &key, nick, false)
    }

    fn claim(&self, domain: &str, key: &str, nick: &str, permanent: bool) -> bool {
        self.claims
            .try_claim(domain, key, nick, permanent, |owner| self.resolver.is_live(domain, owner))
    }

    /// Whether `client` should report a shared event.
    fn should_forward(&self, client: &BridgedClient, line: &Message) -> bool {
        if client.network().bot.enabled {
            return client.is_bot();
        }
        if client.is_bot() {
            return false;
        }
        self.attempt_claim(client.domain(), &client.nick(), line)
    }

    fn user(&self, domain: &str, nick: &str) -> IrcUser {
        IrcUser {
            network: domain.to_owned(),
            nick: nick.to_owned(),
            is_virtual: self.resolver.nick_is_virtual(domain, nick),
        }
    }

    /// Start forwarding `conn`'s events on behalf of `client`.
    pub fn add_hooks(self: &Arc<Self>, client: Arc<BridgedClient>, conn: &Arc<ConnectionInstance>) {
        let events = conn.subscribe();
        let broker = self.clone();
        let conn = conn.clone();
        tokio::spawn(async move { broker.run_hooks(client, conn, events).await });
    }

    async fn run_hooks(
        self: Arc<Self>,
        client: Arc<BridgedClient>,
        conn: Arc<ConnectionInstance>,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) {
        let names = Arc::new(NamesBucket::default());
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(event) => self.on_event(&client, &conn, &names, event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(domain = %client.domain(), nick = %client.nick(), skipped = n, "broker: listener lagged");
                }
            }
        }
        trace!(domain = %client.domain(), nick = %client.nick(), "broker: hooks finished");
    }

    fn on_event(
        self: &Arc<Self>,
        client: &Arc<BridgedClient>,
        conn: &ConnectionInstance,
        names_bucket: &Arc<NamesBucket>,
        event: ConnectionEvent,
    ) {
        match event {
            ConnectionEvent::RawLine(msg) => self.on_line(client, &conn.support(), msg),
            ConnectionEvent::Names { channel, names } => {
                if !self.should_forward_names(client, &channel) {
                    return;
                }
                let support = conn.support();
                let entries = names.into_iter().map(|(nick, symbols)| {
                    let mode = support
                        .strongest_prefix(&symbols)
                        .and_then(|p| support.mode_for_prefix(p));
                    NamesEntry {
                        channel: channel.clone(),
                        nick,
                        mode,
                    }
                });
                if names_bucket.push(entries) {
                    tokio::spawn(self.clone().drain_names(client.domain().to_owned(), names_bucket.clone()));
                }
            }
            ConnectionEvent::UserQuit { nick, reason, channels, line } => {
                if !self.should_forward(client, &line) {
                    return;
                }
                let broker = self.clone();
                let network = client.network().clone();
                tokio::spawn(async move {
                    if !broker.debouncer.debounce_quit(&network, &nick).await {
                        debug!(domain = %network.domain, %nick, "broker: quit swallowed by rejoin");
                        return;
                    }
                    for channel in channels {
                        let user = broker.user(&network.domain, &nick);
                        let res = broker
                            .handler
                            .on_part(&network.domain, user, &channel, PartKind::Quit, Some(&reason))
                            .await;
                        report(&network.domain, "quit", res);
                    }
                });
            }
            ConnectionEvent::UserNick { old, new, channels, line } => {
                if !self.should_forward(client, &line) {
                    return;
                }
                let broker = self.clone();
                let domain = client.domain().to_owned();
                tokio::spawn(async move {
                    for channel in channels {
                        let res = broker
                            .handler
                            .on_part(&domain, broker.user(&domain, &old), &channel, PartKind::Nick, None)
                            .await;
                        report(&domain, "nick-part", res);
                        let res = broker
                            .handler
                            .on_join(&domain, broker.user(&domain, &new), &channel, JoinKind::Nick)
                            .await;
                        report(&domain, "nick-join", res);
                    }
                });
            }
            _ => {}
        }
    }

    fn should_forward_names(&self, client: &BridgedClient, channel: &str) -> bool {
        if client.network().bot.enabled {
            return client.is_bot();
        }
        if client.is_bot() {
            return false;
        }
        self.claim(client.domain(), &names_key(&irc_lowercase(channel)), &client.nick(), true)
    }

    /// Feed queued NAMES entries to the handler one at a time, newest
    /// first, until the bucket is empty.
    async fn drain_names(self: Arc<Self>, domain: String, bucket: Arc<NamesBucket>) {
        debug!(%domain, "broker: draining names");
        while let Some(NamesEntry { channel, nick, mode }) = bucket.pop() {
            let res = self
                .handler
                .on_join(&domain, self.user(&domain, &nick), &channel, JoinKind::Names)
                .await;
            report(&domain, "names", res);

            if let Some(mode) = mode {
                let res = self
                    .handler
                    .on_mode(&domain, &channel, &nick, mode, true, Some(&nick))
                    .await;
                report(&domain, "names-mode", res);
            }
        }
    }

    fn on_line(self: &Arc<Self>, client: &Arc<BridgedClient>, support: &ServerSupport, msg: Message) {
        let domain = client.domain().to_owned();
        let Some(from) = msg.source_nick().map(str::to_owned) else {
            trace!(%domain, line = %msg, "broker: ignoring server-originated line");
            return;
        };

        match msg.command.as_str() {
            "PRIVMSG" | "NOTICE" => {
                let target = msg.param(0).to_owned();
                let Some(action) = action_for(&msg) else { return };
                if support.is_channel(&target) {
                    if self.should_forward(client, &msg) {
                        self.forward_ordered(domain, from, target, action);
                    }
                } else if irc_lowercase(&target) == irc_lowercase(&client.nick()) {
                    self.forward_private(client, from, target, action);
                }
            }
            "INVITE" => {
                let invitee = msg.param(0).to_owned();
                let channel = msg.param(1).to_owned();
                if irc_lowercase(&invitee) != irc_lowercase(&client.nick()) {
                    return;
                }
                let broker = self.clone();
                tokio::spawn(async move {
                    let res = broker
                        .handler
                        .on_invite(&domain, broker.user(&domain, &from), broker.user(&domain, &invitee), &channel)
                        .await;
                    report(&domain, "invite", res);
                });
            }
            "JOIN" => {
                if !self.should_forward(client, &msg) {
                    return;
                }
                self.debouncer.on_join(&domain, &from);
                let channel = msg.param(0).to_owned();
                let broker = self.clone();
                tokio::spawn(async move {
                    let res = broker
                        .handler
                        .on_join(&domain, broker.user(&domain, &from), &channel, JoinKind::Join)
                        .await;
                    report(&domain, "join", res);
                });
            }
            "PART" => {
                if !self.should_forward(client, &msg) {
                    return;
                }
                let channel = msg.param(0).to_owned();
                let reason = msg.params.get(1).cloned();
                let broker = self.clone();
                tokio::spawn(async move {
                    let res = broker
                        .handler
                        .on_part(&domain, broker.user(&domain, &from), &channel, PartKind::Part, reason.as_deref())
                        .await;
                    report(&domain, "part", res);
                });
            }
            "KICK" => {
                if !self.should_forward(client, &msg) {
                    return;
                }
                let (channel, kicked, reason) = (msg.param(0).to_owned(), msg.param(1).to_owned(), msg.param(2).to_owned());
                let broker = self.clone();
                tokio::spawn(async move {
                    let res = broker
                        .handler
                        .on_kick(&domain, broker.user(&domain, &from), broker.user(&domain, &kicked), &channel, &reason)
                        .await;
                    report(&domain, "kick", res);
                });
            }
            "TOPIC" => {
                if !self.should_forward(client, &msg) {
                    return;
                }
                let channel = msg.param(0).to_owned();
                let action = IrcAction::new(ActionKind::Topic, msg.param(1));
                let broker = self.clone();
                tokio::spawn(async move {
                    let res = broker
                        .handler
                        .on_topic(&domain, broker.user(&domain, &from), &channel, action)
                        .await;
                    report(&domain, "topic", res);
                });
            }
            "MODE" => {
                let channel = msg.param(0).to_owned();
                if !support.is_channel(&channel) || !self.should_forward(client, &msg) {
                    return;
                }
                let changes = support.parse_mode_changes(msg.param(1), msg.params.get(2..).unwrap_or(&[]));
                let broker = self.clone();
                tokio::spawn(async move {
                    for change in changes {
                        let res = broker
                            .handler
                            .on_mode(&domain, &channel, &from, change.mode, change.adding, change.arg.as_deref())
                            .await;
                        report(&domain, "mode", res);
                    }
                });
            }
            _ => {}
        }
    }

    /// Private traffic is reported by the client it was sent to; no claims.
    fn forward_private(self: &Arc<Self>, client: &BridgedClient, from: String, target: String, action: IrcAction) {
        let domain = client.domain().to_owned();
        if get_valid_nick(&target, true, None).is_err() {
            report(&domain, "private", Err(HandlerRejection::Dropped));
            return;
        }
        let to = IrcUser {
            network: domain.clone(),
            nick: target,
            is_virtual: true,
        };
        let broker = self.clone();
        tokio::spawn(async move {
            let res = broker
                .handler
                .on_private_message(&domain, broker.user(&domain, &from), to, action)
                .await;
            report(&domain, "private", res);
        });
    }

    /// Deliver a channel message after the previous one for the same
    /// channel, waiting at most [`SOFT_ORDER_WAIT`] for it.
    fn forward_ordered(self: &Arc<Self>, domain: String, from: String, channel: String, action: IrcAction) {
        let slot_key = format!("{domain} {}", irc_lowercase(&channel));
        let seq = {
            let mut seq = lock(&self.order_seq);
            *seq += 1;
            *seq
        };

        let mut order = lock(&self.order);
        let previous = order.get(&slot_key).map(|(_, fut)| fut.clone());
        let broker = self.clone();
        let key = slot_key.clone();
        let delivery = async move {
            if let Some(previous) = previous {
                if tokio::time::timeout(SOFT_ORDER_WAIT, previous).await.is_err() {
                    warn!(%domain, %channel, "broker: previous message still pending, sending out of order");
                }
            }
            let res = broker
                .handler
                .on_message(&domain, broker.user(&domain, &from), &channel, action)
                .await;
            report(&domain, "message", res);

            let mut order = lock(&broker.order);
            if order.get(&key).is_some_and(|(s, _)| *s == seq) {
                order.remove(&key);
            }
        }
        .boxed()
        .shared();
        order.insert(slot_key, (seq, delivery.clone()));
        drop(order);
        tokio::spawn(delivery);
    }

    /// Tell the user behind `client` about their connection.
    pub async fn send_metadata(&self, client: &BridgedClient, text: &str, force: bool, reply: Option<ErrorReply>) {
        if client.is_bot() {
            return;
        }
        if !force && !client.network().connection_notices {
            return;
        }
        let res = self
            .handler
            .on_metadata(client.domain(), &client.nick(), client.user_id(), text, force, reply)
            .await;
        report(client.domain(), "metadata", res);
    }
}

/// Text, notice or emote carried by a PRIVMSG/NOTICE. Other CTCP is not
/// bridged.
fn action_for(msg: &Message) -> Option<IrcAction> {
    let text = msg.param(1);
    if let Some(body) = msg.ctcp_body() {
        let emote = body.strip_prefix("ACTION ").filter(|_| msg.command == "PRIVMSG")?;
        return Some(IrcAction::new(ActionKind::Emote, emote));
    }
    let kind = if msg.command == "NOTICE" {
        ActionKind::Notice
    } else {
        ActionKind::Message
    };
    Some(IrcAction::new(kind, text))
}
