/// Net-split smoothing for QUITs.
///
/// A burst of departures faster than a network's `quits_per_second`
/// looks like a split. Each departure in the burst is held for a random
/// delay; if the user rejoins in that time the departure is swallowed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::handler::{Presence, RoomHandler};
use crate::config::NetworkConfig;

const QUIT_WAIT_DELAY: Duration = Duration::from_millis(100);
const QUIT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct DomainState {
    departures: VecDeque<Instant>,
    /// nick → (hold id, rejoin signal)
    rejoins: HashMap<String, (u64, oneshot::Sender<()>)>,
}

pub struct QuitDebouncer {
    handler: Arc<dyn RoomHandler>,
    domains: Mutex<HashMap<String, DomainState>>,
    next_hold: Mutex<u64>,
}

impl QuitDebouncer {
    pub fn new(handler: Arc<dyn RoomHandler>) -> Self {
        Self {
            handler,
            domains: Mutex::new(HashMap::new()),
            next_hold: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DomainState>> {
        self.domains.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A JOIN from `nick`: cancel any departure being held for them.
    pub fn on_join(&self, domain: &str, nick: &str) {
        let waiter = self
            .lock()
            .get_mut(domain)
            .and_then(|state| state.rejoins.remove(nick));
        if let Some((_, tx)) = waiter {
            debug!(domain, nick, "quit-debounce: user rejoined during hold");
            let _ = tx.send(());
        }
    }

    /// Departures recorded in the last second for `domain`.
    pub fn recent_departures(&self, domain: &str) -> usize {
        self.lock().get(domain).map_or(0, |s| s.departures.len())
    }

    /// Decide whether `nick`'s QUIT should be bridged as a departure.
    /// Resolves `false` only when the user came back during a hold.
    pub async fn debounce_quit(&self, network: &NetworkConfig, nick: &str) -> bool {
        let cfg = &network.quit_debounce;
        if !cfg.enabled {
            return true;
        }
        let domain = network.domain.as_str();

        {
            let now = Instant::now();
            let mut domains = self.lock();
            let state = domains.entry(domain.to_owned()).or_default();
            state.departures.push_back(now);
            while state
                .departures
                .front()
                .is_some_and(|t| now.duration_since(*t) >= QUIT_WINDOW)
            {
                state.departures.pop_front();
            }
        }

        // Give other splitters a moment to arrive.
        tokio::time::sleep(QUIT_WAIT_DELAY).await;
        let split = self.recent_departures(domain) > cfg.quits_per_second;

        if let Err(e) = self.handler.on_presence(domain, nick, Presence::Offline).await {
            error!(domain, nick, "quit-debounce: failed to set presence offline: {e}");
        }

        if !split {
            return true;
        }

        let delay_ms = if cfg.delay_max_ms > cfg.delay_min_ms {
            rand::thread_rng().gen_range(cfg.delay_min_ms..=cfg.delay_max_ms)
        } else {
            cfg.delay_min_ms
        };
        if delay_ms == 0 {
            return true;
        }
        info!(domain, nick, delay_ms, "quit-debounce: net-split suspected, holding departure");

        let hold = {
            let mut next = self.next_hold.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        let (tx, rx) = oneshot::channel();
        self.lock()
            .entry(domain.to_owned())
            .or_default()
            .rejoins
            .insert(nick.to_owned(), (hold, tx));

        match tokio::time::timeout(Duration::from_millis(delay_ms), rx).await {
            Ok(Ok(())) => false,
            // Replaced by a newer hold for the same nick.
            Ok(Err(_)) => true,
            Err(_) => {
                let mut domains = self.lock();
                if let Some(state) = domains.get_mut(domain) {
                    if state.rejoins.get(nick).is_some_and(|(id, _)| *id == hold) {
                        state.rejoins.remove(nick);
                    }
                }
                info!(domain, nick, "quit-debounce: user did not rejoin");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::handler::{HandlerResult, IrcAction, IrcUser, JoinKind, PartKind};
    use crate::config::QuitDebounceConfig;
    use crate::irc::reply::ErrorReply;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct PresenceLog(Mutex<Vec<String>>);

    #[async_trait]
    impl RoomHandler for PresenceLog {
        async fn on_join(&self, _: &str, _: IrcUser, _: &str, _: JoinKind) -> HandlerResult {
            Ok(())
        }
        async fn on_part(&self, _: &str, _: IrcUser, _: &str, _: PartKind, _: Option<&str>) -> HandlerResult {
            Ok(())
        }
        async fn on_message(&self, _: &str, _: IrcUser, _: &str, _: IrcAction) -> HandlerResult {
            Ok(())
        }
        async fn on_private_message(&self, _: &str, _: IrcUser, _: IrcUser, _: IrcAction) -> HandlerResult {
            Ok(())
        }
        async fn on_mode(&self, _: &str, _: &str, _: &str, _: char, _: bool, _: Option<&str>) -> HandlerResult {
            Ok(())
        }
        async fn on_kick(&self, _: &str, _: IrcUser, _: IrcUser, _: &str, _: &str) -> HandlerResult {
            Ok(())
        }
        async fn on_topic(&self, _: &str, _: IrcUser, _: &str, _: IrcAction) -> HandlerResult {
            Ok(())
        }
        async fn on_invite(&self, _: &str, _: IrcUser, _: IrcUser, _: &str) -> HandlerResult {
            Ok(())
        }
        async fn on_metadata(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: &str,
            _: bool,
            _: Option<ErrorReply>,
        ) -> HandlerResult {
            Ok(())
        }
        async fn on_presence(&self, _: &str, nick: &str, _: Presence) -> HandlerResult {
            self.0.lock().unwrap().push(nick.to_owned());
            Ok(())
        }
    }

    fn network(enabled: bool) -> NetworkConfig {
        NetworkConfig {
            quit_debounce: QuitDebounceConfig {
                enabled,
                quits_per_second: 5,
                delay_min_ms: 60_000,
                delay_max_ms: 120_000,
            },
            ..NetworkConfig::new("irc.example.org")
        }
    }

    fn debouncer() -> (Arc<QuitDebouncer>, Arc<PresenceLog>) {
        let log = Arc::new(PresenceLog::default());
        (Arc::new(QuitDebouncer::new(log.clone())), log)
    }

    async fn burst(d: &Arc<QuitDebouncer>, net: &Arc<NetworkConfig>, count: usize) -> Vec<tokio::task::JoinHandle<bool>> {
        let handles: Vec<_> = (0..count)
            .map(|i| {
                let (d, net) = (d.clone(), net.clone());
                tokio::spawn(async move { d.debounce_quit(&net, &format!("user{i}")).await })
            })
            .collect();
        // Let every departure register and pass the settle wait.
        tokio::time::sleep(Duration::from_millis(150)).await;
        handles
    }

    // ── Pass-through ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn disabled_network_propagates_immediately() {
        let (d, log) = debouncer();
        assert!(d.debounce_quit(&network(false), "alice").await);
        assert!(log.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn under_threshold_propagates_after_settle() {
        let (d, log) = debouncer();
        let start = Instant::now();
        assert!(d.debounce_quit(&network(true), "alice").await);
        assert!(Instant::now() - start >= QUIT_WAIT_DELAY);
        assert_eq!(*log.0.lock().unwrap(), vec!["alice".to_owned()]);
    }

    // ── Split detection ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn six_departures_are_a_split_and_rejoin_cancels() {
        let (d, _log) = debouncer();
        let net = Arc::new(network(true));
        let handles = burst(&d, &net, 6).await;
        assert_eq!(d.recent_departures("irc.example.org"), 6);
        for h in &handles {
            assert!(!h.is_finished());
        }

        d.on_join("irc.example.org", "user3");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(handles[3].is_finished());

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert_eq!(results, vec![true, true, true, false, true, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn held_departure_propagates_after_delay() {
        let (d, _log) = debouncer();
        let net = Arc::new(network(true));
        let start = Instant::now();
        let handles = burst(&d, &net, 6).await;
        for h in handles {
            assert!(h.await.unwrap());
        }
        let held = Instant::now() - start;
        assert!(held >= Duration::from_millis(60_000));
        assert!(held <= Duration::from_millis(120_200));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_propagates_during_split() {
        let (d, _log) = debouncer();
        let mut net = network(true);
        net.quit_debounce.delay_min_ms = 0;
        net.quit_debounce.delay_max_ms = 0;
        let handles = burst(&d, &Arc::new(net), 6).await;
        for h in handles {
            assert!(h.await.unwrap());
        }
    }
}
