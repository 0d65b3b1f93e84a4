/// Claim table: which client reported a given wire event.
///
/// Keys are per network. Each entry has exactly one owner nick; ordinary
/// claims carry a timestamp and are swept after [`CLAIM_TTL`], NAMES
/// snapshots never expire.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::message::Message;

pub const CLAIM_TTL: Duration = Duration::from_secs(10 * 60);

/// The claim key for a line: prefix, command and params.
pub fn claim_key(msg: &Message) -> Option<String> {
    let prefix = msg.prefix.as_deref()?;
    if msg.command.is_empty() {
        return None;
    }
    Some(format!("{prefix}{}{}", msg.command, msg.params.join("")))
}

/// The claim key for a completed NAMES listing.
pub fn names_key(channel: &str) -> String {
    format!("server_sent names {channel}")
}

#[derive(Debug, Clone)]
struct Claim {
    nick: String,
    at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ClaimTable {
    entries: Mutex<HashMap<String, HashMap<String, Claim>>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Claim>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn claimer(&self, domain: &str, key: &str) -> Option<String> {
        self.lock().get(domain)?.get(key).map(|c| c.nick.clone())
    }

    /// Record `nick` as owner of `key`, replacing any previous owner.
    pub fn claim(&self, domain: &str, key: &str, nick: &str, permanent: bool) {
        let at = (!permanent).then(Instant::now);
        self.lock()
            .entry(domain.to_owned())
            .or_default()
            .insert(key.to_owned(), Claim { nick: nick.to_owned(), at });
    }

    /// Claim `key` for `nick` unless someone else holds it and `owner_alive`
    /// says they are still around. The check and the write happen under one
    /// lock, so two clients can never both win the same key.
    pub fn try_claim(
        &self,
        domain: &str,
        key: &str,
        nick: &str,
        permanent: bool,
        owner_alive: impl FnOnce(&str) -> bool,
    ) -> bool {
        let mut entries = self.lock();
        let table = entries.entry(domain.to_owned()).or_default();
        if let Some(existing) = table.get(key) {
            if existing.nick != nick {
                if owner_alive(&existing.nick) {
                    return false;
                }
                debug!(domain, key, from = %existing.nick, to = nick, "claims: stealing from dead owner");
            }
        }
        let at = (!permanent).then(Instant::now);
        table.insert(key.to_owned(), Claim { nick: nick.to_owned(), at });
        true
    }

    /// Drop timestamped claims older than `ttl`. Returns how many went.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut entries = self.lock();
        for (domain, table) in entries.iter_mut() {
            let before = table.len();
            table.retain(|_, claim| claim.at.map_or(true, |at| now.duration_since(at) <= ttl));
            let gone = before - table.len();
            if gone > 0 {
                debug!(domain, count = gone, "claims: cleaning up expired entries");
            }
            removed += gone;
        }
        removed
    }

    pub fn len(&self, domain: &str) -> usize {
        self.lock().get(domain).map_or(0, HashMap::len)
    }

    /// Sweep every `CLAIM_TTL` until the handle is aborted.
    pub fn spawn_cleaner(self: &Arc<Self>) -> JoinHandle<()> {
        let table = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + CLAIM_TTL, CLAIM_TTL);
            loop {
                tick.tick().await;
                let Some(table) = table.upgrade() else { break };
                table.sweep(CLAIM_TTL);
            }
        })
    }
}
