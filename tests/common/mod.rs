#![allow(dead_code)]
/// In-memory IRC server for driving real connections in tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use tidepool::bridge::handler::{
    HandlerResult, IrcAction, IrcUser, JoinKind, PartKind, RoomHandler,
};
use tidepool::config::NetworkConfig;
use tidepool::irc::codec::IrcCodec;
use tidepool::irc::message::Message;
use tidepool::irc::reply::ErrorReply;
use tidepool::irc::transport::{ConnectTarget, Connector, IrcStream};

pub const DOMAIN: &str = "irc.test";
const WAIT: Duration = Duration::from_secs(5);

/// Hands the server half of every new connection to the test.
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, Listener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { accepted: tx }), Listener { rx })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _target: &ConnectTarget) -> io::Result<IrcStream> {
        let (client, server) = tokio::io::duplex(16 * 1024);
        self.accepted
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
        Ok(Box::new(client))
    }
}

pub struct Listener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Listener {
    pub async fn accept(&mut self) -> FakeServer {
        self.accept_within(WAIT).await
    }

    /// Wait up to `window` for the next connection attempt.
    pub async fn accept_within(&mut self, window: Duration) -> FakeServer {
        let stream = tokio::time::timeout(window, self.rx.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped");
        FakeServer {
            framed: Framed::new(stream, IrcCodec),
            nick: String::new(),
        }
    }

    /// Assert no connection attempt is made for a while.
    pub async fn expect_no_connection(&mut self, window: Duration) {
        if let Ok(Some(_)) = tokio::time::timeout(window, self.rx.recv()).await {
            panic!("unexpected connection attempt");
        }
    }
}

/// The server end of one connection.
pub struct FakeServer {
    framed: Framed<DuplexStream, IrcCodec>,
    pub nick: String,
}

impl FakeServer {
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for a line")
            .expect("client closed the connection")
            .expect("bad line from client")
    }

    /// Skip lines until one with `command` arrives.
    pub async fn expect(&mut self, command: &str) -> Message {
        loop {
            let msg = self.recv().await;
            if msg.command == command {
                return msg;
            }
        }
    }

    pub async fn send(&mut self, raw: &str) {
        let msg = Message::parse(raw).expect("test line must parse");
        self.framed.send(msg).await.expect("client went away");
    }

    /// Read NICK/USER and welcome whatever nick was asked for.
    pub async fn register(&mut self) -> String {
        let nick = self.expect("NICK").await.param(0).to_owned();
        self.expect("USER").await;
        self.welcome(&nick).await;
        nick
    }

    pub async fn welcome(&mut self, nick: &str) {
        self.nick = nick.to_owned();
        self.send(&format!(":srv.test 001 {nick} :Welcome to the test network")).await;
        self.send(&format!(":srv.test 005 {nick} NICKLEN=16 CHANTYPES=# PREFIX=(ov)@+ :are supported"))
            .await;
    }

    /// Answer a JOIN for `channel` with the echo and an empty NAMES list.
    pub async fn accept_join(&mut self, channel: &str) {
        let join = self.expect("JOIN").await;
        assert_eq!(join.param(0), channel);
        let nick = self.nick.clone();
        self.send(&format!(":{nick}!u@host JOIN {channel}")).await;
        self.send(&format!(":srv.test 353 {nick} = {channel} :{nick}")).await;
        self.send(&format!(":srv.test 366 {nick} {channel} :End of /NAMES list.")).await;
    }

    /// Answer the next WHOIS as if nobody holds the nick.
    pub async fn whois_unknown(&mut self) {
        let whois = self.expect("WHOIS").await;
        let (me, target) = (self.nick.clone(), whois.param(0).to_owned());
        self.send(&format!(":srv.test 401 {me} {target} :No such nick/channel")).await;
        self.send(&format!(":srv.test 318 {me} {target} :End of /WHOIS list.")).await;
    }

    /// Assert nothing arrives for a short while.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(Ok(msg))) = tokio::time::timeout(window, self.framed.next()).await {
            panic!("unexpected line: {msg}");
        }
    }
}

pub fn network() -> NetworkConfig {
    let mut net = NetworkConfig::new(DOMAIN);
    net.reconnect_interval_ms = 0;
    net.flood_delay_ms = 0;
    net.join_timeout_ms = 2_000;
    net.nick_timeout_ms = 2_000;
    net.bot.enabled = false;
    net
}

/// Handler that records what it was told, one line per call.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    names_delay: Option<Duration>,
    names_running: AtomicUsize,
    names_peak: AtomicUsize,
}

impl Recorder {
    /// A recorder whose NAMES joins take `delay` each.
    pub fn with_names_delay(delay: Duration) -> Self {
        Self {
            names_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Most NAMES joins that were in the handler at once.
    pub fn names_peak(&self) -> usize {
        self.names_peak.load(Ordering::SeqCst)
    }

    fn push(&self, line: String) -> HandlerResult {
        self.events.lock().unwrap().push(line);
        Ok(())
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RoomHandler for Recorder {
    async fn on_join(&self, _: &str, user: IrcUser, channel: &str, kind: JoinKind) -> HandlerResult {
        if let (JoinKind::Names, Some(delay)) = (kind, self.names_delay) {
            let running = self.names_running.fetch_add(1, Ordering::SeqCst) + 1;
            self.names_peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.names_running.fetch_sub(1, Ordering::SeqCst);
        }
        self.push(format!("join {:?} {} {channel}", kind, user.nick))
    }

    async fn on_part(&self, _: &str, user: IrcUser, channel: &str, kind: PartKind, _: Option<&str>) -> HandlerResult {
        self.push(format!("part {:?} {} {channel}", kind, user.nick))
    }

    async fn on_message(&self, _: &str, from: IrcUser, channel: &str, action: IrcAction) -> HandlerResult {
        self.push(format!("message {} {channel} {}", from.nick, action.text))
    }

    async fn on_private_message(&self, _: &str, from: IrcUser, to: IrcUser, action: IrcAction) -> HandlerResult {
        self.push(format!("private {} {} {}", from.nick, to.nick, action.text))
    }

    async fn on_mode(&self, _: &str, channel: &str, by: &str, mode: char, enabled: bool, arg: Option<&str>) -> HandlerResult {
        let sign = if enabled { '+' } else { '-' };
        self.push(format!("mode {channel} {sign}{mode} {} by {by}", arg.unwrap_or("")))
    }

    async fn on_kick(&self, _: &str, by: IrcUser, kicked: IrcUser, channel: &str, _: &str) -> HandlerResult {
        self.push(format!("kick {} {} {channel}", by.nick, kicked.nick))
    }

    async fn on_topic(&self, _: &str, by: IrcUser, channel: &str, action: IrcAction) -> HandlerResult {
        self.push(format!("topic {} {channel} {}", by.nick, action.text))
    }

    async fn on_invite(&self, _: &str, from: IrcUser, invitee: IrcUser, channel: &str) -> HandlerResult {
        self.push(format!("invite {} {} {channel}", from.nick, invitee.nick))
    }

    async fn on_metadata(
        &self,
        _: &str,
        nick: &str,
        _: Option<&str>,
        text: &str,
        force: bool,
        _: Option<ErrorReply>,
    ) -> HandlerResult {
        self.push(format!("metadata {nick} force={force} {text}"))
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}
