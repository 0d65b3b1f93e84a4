/// The other half of the bridge, as the connection core sees it.
///
/// Every event that survives claim/steal deduplication ends up in exactly
/// one [`RoomHandler`] call. Handlers reject events they cannot place with
/// a [`HandlerRejection`]; the core logs those and moves on.

use async_trait::async_trait;

use crate::irc::reply::ErrorReply;

/// An IRC user as the handler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcUser {
    pub network: String,
    pub nick: String,
    /// True when the nick belongs to one of our own bridged clients.
    pub is_virtual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Join,
    Names,
    Nick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Part,
    Quit,
    Nick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Message,
    Notice,
    Emote,
    Topic,
}

/// Text moving in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcAction {
    pub kind: ActionKind,
    pub text: String,
    /// When the other side produced it; used for expiry.
    pub ts: Option<std::time::SystemTime>,
}

impl IrcAction {
    pub fn new(kind: ActionKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            ts: None,
        }
    }

    pub fn at(mut self, ts: std::time::SystemTime) -> Self {
        self.ts = Some(ts);
        self
    }
}

/// Presence the debouncer sets while it waits to see if a user comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerRejection {
    #[error("channel is not mapped to any room")]
    NotMapped,
    #[error("event came from a virtual identity")]
    VirtualIdentity,
    #[error("event dropped")]
    Dropped,
}

pub type HandlerResult = Result<(), HandlerRejection>;

#[async_trait]
pub trait RoomHandler: Send + Sync {
    async fn on_join(&self, network: &str, user: IrcUser, channel: &str, kind: JoinKind) -> HandlerResult;

    async fn on_part(
        &self,
        network: &str,
        user: IrcUser,
        channel: &str,
        kind: PartKind,
        reason: Option<&str>,
    ) -> HandlerResult;

    async fn on_message(&self, network: &str, from: IrcUser, channel: &str, action: IrcAction) -> HandlerResult;

    async fn on_private_message(
        &self,
        network: &str,
        from: IrcUser,
        to: IrcUser,
        action: IrcAction,
    ) -> HandlerResult;

    async fn on_mode(
        &self,
        network: &str,
        channel: &str,
        by: &str,
        mode: char,
        enabled: bool,
        arg: Option<&str>,
    ) -> HandlerResult;

    async fn on_kick(
        &self,
        network: &str,
        by: IrcUser,
        kicked: IrcUser,
        channel: &str,
        reason: &str,
    ) -> HandlerResult;

    async fn on_topic(&self, network: &str, by: IrcUser, channel: &str, action: IrcAction) -> HandlerResult;

    async fn on_invite(&self, network: &str, from: IrcUser, invitee: IrcUser, channel: &str) -> HandlerResult;

    /// A notice about a client's own connection (connects, errors, losses).
    async fn on_metadata(
        &self,
        network: &str,
        nick: &str,
        user_id: Option<&str>,
        text: &str,
        force: bool,
        reply: Option<ErrorReply>,
    ) -> HandlerResult;

    async fn on_presence(&self, _network: &str, _nick: &str, _presence: Presence) -> HandlerResult {
        Ok(())
    }
}

/// A handler that only logs. Used by the binary when no room side is
/// attached, and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl RoomHandler for LoggingHandler {
    async fn on_join(&self, network: &str, user: IrcUser, channel: &str, kind: JoinKind) -> HandlerResult {
        tracing::info!(network, nick = %user.nick, channel, ?kind, "room: join");
        Ok(())
    }

    async fn on_part(
        &self,
        network: &str,
        user: IrcUser,
        channel: &str,
        kind: PartKind,
        reason: Option<&str>,
    ) -> HandlerResult {
        tracing::info!(network, nick = %user.nick, channel, ?kind, reason, "room: part");
        Ok(())
    }

    async fn on_message(&self, network: &str, from: IrcUser, channel: &str, action: IrcAction) -> HandlerResult {
        tracing::info!(network, nick = %from.nick, channel, kind = ?action.kind, text = %action.text, "room: message");
        Ok(())
    }

    async fn on_private_message(&self, network: &str, from: IrcUser, to: IrcUser, action: IrcAction) -> HandlerResult {
        tracing::info!(network, from = %from.nick, to = %to.nick, kind = ?action.kind, "room: private message");
        Ok(())
    }

    async fn on_mode(
        &self,
        network: &str,
        channel: &str,
        by: &str,
        mode: char,
        enabled: bool,
        arg: Option<&str>,
    ) -> HandlerResult {
        let sign = if enabled { '+' } else { '-' };
        tracing::info!(network, channel, by, mode = %format!("{sign}{mode}"), arg, "room: mode");
        Ok(())
    }

    async fn on_kick(&self, network: &str, by: IrcUser, kicked: IrcUser, channel: &str, reason: &str) -> HandlerResult {
        tracing::info!(network, by = %by.nick, kicked = %kicked.nick, channel, reason, "room: kick");
        Ok(())
    }

    async fn on_topic(&self, network: &str, by: IrcUser, channel: &str, action: IrcAction) -> HandlerResult {
        tracing::info!(network, by = %by.nick, channel, topic = %action.text, "room: topic");
        Ok(())
    }

    async fn on_invite(&self, network: &str, from: IrcUser, invitee: IrcUser, channel: &str) -> HandlerResult {
        tracing::info!(network, from = %from.nick, invitee = %invitee.nick, channel, "room: invite");
        Ok(())
    }

    async fn on_metadata(
        &self,
        network: &str,
        nick: &str,
        user_id: Option<&str>,
        text: &str,
        force: bool,
        reply: Option<ErrorReply>,
    ) -> HandlerResult {
        tracing::info!(network, nick, user_id, force, reply = ?reply, "notice: {text}");
        Ok(())
    }
}
