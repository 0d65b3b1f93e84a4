/// A single `ConnectionInstance` against the in-memory server.
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tidepool::config::NetworkConfig;
use tidepool::error::ConnectError;
use tidepool::irc::connection::{
    ConnectOptions, ConnectionEvent, ConnectionInstance, ConnectionState, DisconnectReason, BAN_COOLDOWN,
    THROTTLE_WAIT,
};
use tidepool::irc::scheduler::SchedulerRegistry;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{network, FakeServer, MockConnector};

fn no_hook(_: &Arc<ConnectionInstance>) {}

fn options(nick: &str) -> ConnectOptions {
    ConnectOptions {
        nick: nick.into(),
        username: "tidepool".into(),
        realname: "Test User".into(),
        password: None,
        local_address: None,
        homeserver_domain: "example.com".into(),
    }
}

async fn next_matching(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    mut pred: impl FnMut(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

// ── Registration ─────────────────────────────────────────────────

#[tokio::test]
async fn registers_and_reports_connected() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;

    let nick = server.expect("NICK").await;
    assert_eq!(nick.param(0), "alice");
    let user = server.expect("USER").await;
    assert_eq!(user.params, vec!["tidepool", "8", "*", "Test User"]);
    server.welcome("alice").await;

    assert_eq!(connected.await.unwrap(), Ok(()));
    assert_eq!(inst.state(), ConnectionState::Connected);
    assert_eq!(inst.nick(), "alice");
}

#[tokio::test]
async fn nick_in_use_during_registration_retries_with_suffix() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;

    server.expect("NICK").await;
    server.send(":srv.test 433 * alice :Nickname is already in use").await;
    let retry = server.expect("NICK").await;
    assert_eq!(retry.param(0), "alice1");
    server.welcome("alice1").await;

    assert_eq!(connected.await.unwrap(), Ok(()));
    assert_eq!(inst.nick(), "alice1");
}

#[tokio::test]
async fn error_line_before_registration_rejects_the_attempt() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;

    server.expect("USER").await;
    server
        .send("ERROR :Closing Link: 127.0.0.1 (Throttled: Reconnecting too fast)")
        .await;

    assert_eq!(connected.await.unwrap(), Err(DisconnectReason::Throttled));
    assert!(inst.is_dead());
    assert_eq!(inst.state(), ConnectionState::Dead);
}

#[tokio::test]
async fn fatal_numeric_is_a_ban() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (_inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;

    server.expect("USER").await;
    server.send(":srv.test 465 alice :You are banned from this server").await;
    assert_eq!(connected.await.unwrap(), Err(DisconnectReason::Banned));
}

// ── Teardown ─────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_twice_runs_teardown_once() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;
    server.register().await;
    connected.await.unwrap().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    inst.set_on_disconnect(Box::new(move |reason| {
        assert_eq!(reason, DisconnectReason::Killed);
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    inst.disconnect(DisconnectReason::Killed, Some("bye"));
    inst.disconnect(DisconnectReason::Killed, Some("bye again"));

    let quit = server.expect("QUIT").await;
    assert_eq!(quit.param(0), "bye");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!inst.send(tidepool::irc::message::Message::new("PRIVMSG", ["#x", "late"])));
}

#[tokio::test]
async fn ping_timeout_knifes_the_connection() {
    let (connector, mut listener) = MockConnector::new();
    let mut net = network();
    net.ping_timeout_ms = 300;
    let (inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut events = inst.subscribe();
    let mut server = listener.accept().await;
    server.register().await;
    let _ = connected.await;

    let event = next_matching(&mut events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
    assert!(matches!(event, ConnectionEvent::Disconnected { reason: DisconnectReason::NetError }));
}

#[tokio::test]
async fn server_ping_is_answered() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (_inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;
    server.register().await;
    connected.await.unwrap().unwrap();

    server.send("PING :srv.test").await;
    let pong = server.expect("PONG").await;
    assert_eq!(pong.param(0), "srv.test");
}

// ── Wire behaviour ───────────────────────────────────────────────

#[tokio::test]
async fn ctcp_version_gets_a_notice() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (_inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;
    server.register().await;
    connected.await.unwrap().unwrap();

    server.send(":bob!b@host PRIVMSG alice :\u{1}VERSION\u{1}").await;
    let notice = server.expect("NOTICE").await;
    assert_eq!(notice.param(0), "bob");
    assert!(notice.param(1).starts_with("\u{1}VERSION tidepool "));
    assert!(notice.param(1).contains("bridged via example.com"));
}

#[tokio::test]
async fn quit_reports_shared_channels() {
    let (connector, mut listener) = MockConnector::new();
    let net = network();
    let (inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut events = inst.subscribe();
    let mut server = listener.accept().await;
    server.register().await;
    connected.await.unwrap().unwrap();

    server.send(":alice!u@host JOIN #one").await;
    server.send(":srv.test 353 alice = #one :@alice +carol").await;
    server.send(":srv.test 366 alice #one :End of /NAMES list.").await;
    server.send(":alice!u@host JOIN #two").await;
    server.send(":carol!c@host QUIT :Ping timeout").await;

    let names = next_matching(&mut events, |e| matches!(e, ConnectionEvent::Names { .. })).await;
    let ConnectionEvent::Names { channel, names } = names else { unreachable!() };
    assert_eq!(channel, "#one");
    assert_eq!(names.get("carol").map(String::as_str), Some("+"));

    let quit = next_matching(&mut events, |e| matches!(e, ConnectionEvent::UserQuit { .. })).await;
    let ConnectionEvent::UserQuit { nick, reason, channels, .. } = quit else { unreachable!() };
    assert_eq!((nick.as_str(), reason.as_str()), ("carol", "Ping timeout"));
    assert_eq!(channels, vec!["#one".to_owned()]);
    assert!(inst.membership("#one", "carol").is_none());
}

// ── Retries ──────────────────────────────────────────────────────

/// Long enough for any backoff under test.
const PATIENCE: Duration = Duration::from_secs(2 * 60 * 60);

fn create(
    net: NetworkConfig,
    nick: &str,
    connector: Arc<MockConnector>,
    scheduler: Arc<SchedulerRegistry>,
    cancel: CancellationToken,
) -> JoinHandle<Result<Arc<ConnectionInstance>, ConnectError>> {
    tokio::spawn(ConnectionInstance::create(
        Arc::new(net),
        options(nick),
        connector,
        scheduler,
        cancel,
        no_hook,
    ))
}

/// Read the registration burst and answer it with `line`.
async fn refuse(server: &mut FakeServer, line: &str) {
    server.expect("USER").await;
    server.send(line).await;
}

const THROTTLED: &str = "ERROR :Closing Link: 127.0.0.1 (Throttled: Reconnecting too fast)";

#[tokio::test(start_paused = true)]
async fn throttle_waits_accumulate_across_retries() {
    let (connector, mut listener) = MockConnector::new();
    let task = create(network(), "alice", connector, Arc::new(SchedulerRegistry::new()), CancellationToken::new());

    let mut first = listener.accept().await;
    refuse(&mut first, THROTTLED).await;
    let refused_once = Instant::now();

    let mut second = listener.accept_within(PATIENCE).await;
    let gap_one = refused_once.elapsed();
    refuse(&mut second, THROTTLED).await;
    let refused_twice = Instant::now();

    let mut third = listener.accept_within(PATIENCE).await;
    let gap_two = refused_twice.elapsed();
    third.register().await;

    assert!(task.await.unwrap().is_ok());
    assert!(gap_one >= THROTTLE_WAIT, "first retry after {gap_one:?}");
    assert!(gap_two >= 2 * THROTTLE_WAIT, "second retry after {gap_two:?}");
    // Jitter for two attempts stays under 3s.
    assert!(gap_two < 2 * THROTTLE_WAIT + Duration::from_secs(3), "second retry after {gap_two:?}");
}

#[tokio::test(start_paused = true)]
async fn ban_waits_out_the_cooldown() {
    let (connector, mut listener) = MockConnector::new();
    let task = create(network(), "alice", connector, Arc::new(SchedulerRegistry::new()), CancellationToken::new());

    let mut first = listener.accept().await;
    refuse(&mut first, ":srv.test 465 alice :You are banned from this server").await;
    let banned = Instant::now();

    let mut second = listener.accept_within(PATIENCE).await;
    let gap = banned.elapsed();
    second.register().await;

    assert!(task.await.unwrap().is_ok());
    assert!(gap >= BAN_COOLDOWN, "retried after {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn other_failures_only_get_jitter() {
    let (connector, mut listener) = MockConnector::new();
    let task = create(network(), "alice", connector, Arc::new(SchedulerRegistry::new()), CancellationToken::new());

    let mut first = listener.accept().await;
    first.expect("USER").await;
    drop(first);
    let dropped = Instant::now();

    let mut second = listener.accept_within(PATIENCE).await;
    let gap = dropped.elapsed();
    second.register().await;

    assert!(task.await.unwrap().is_ok());
    assert!(gap < Duration::from_secs(2), "retried after {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn scheduled_attempts_run_one_at_a_time() {
    let (connector, mut listener) = MockConnector::new();
    let mut net = network();
    net.reconnect_interval_ms = 1000;
    let scheduler = Arc::new(SchedulerRegistry::new());
    let alice = create(net.clone(), "alice", connector.clone(), scheduler.clone(), CancellationToken::new());
    let bob = create(net, "bob", connector, scheduler.clone(), CancellationToken::new());

    // The first attempt is in flight; nobody else may start.
    let mut first = listener.accept().await;
    let first_nick = first.expect("NICK").await.param(0).to_owned();
    listener.expect_no_connection(Duration::from_secs(10)).await;

    refuse(&mut first, "ERROR :Closing Link: 127.0.0.1 (Connection reset)").await;
    let refused = Instant::now();

    let mut second = listener.accept_within(PATIENCE).await;
    assert!(refused.elapsed() >= Duration::from_secs(1));
    let second_nick = second.register().await;
    assert!(second_nick != first_nick);

    // The failed attempt goes back on the queue.
    let mut third = listener.accept_within(PATIENCE).await;
    assert_eq!(third.register().await, first_nick);

    assert!(alice.await.unwrap().is_ok());
    assert!(bob.await.unwrap().is_ok());
    assert_eq!(scheduler.pending(common::DOMAIN), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_stops_the_retries() {
    let (connector, mut listener) = MockConnector::new();
    let cancel = CancellationToken::new();
    let task = create(network(), "alice", connector, Arc::new(SchedulerRegistry::new()), cancel.clone());

    let mut first = listener.accept().await;
    refuse(&mut first, THROTTLED).await;
    cancel.cancel();

    assert!(matches!(task.await.unwrap(), Err(ConnectError::Cancelled)));
    listener.expect_no_connection(PATIENCE).await;
}

// ── Handshake timeout ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn registration_must_finish_before_the_deadline() {
    let (connector, mut listener) = MockConnector::new();
    let mut net = network();
    net.connect_timeout_ms = 5_000;
    let started = Instant::now();
    let (inst, connected) = ConnectionInstance::spawn(&net, &options("alice"), connector, &no_hook);
    let mut server = listener.accept().await;
    server.expect("USER").await;

    assert_eq!(connected.await.unwrap(), Err(DisconnectReason::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(inst.is_dead());
}

