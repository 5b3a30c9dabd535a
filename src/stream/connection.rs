// =============================================================================
// Stream Connection — one multiplexed websocket per upstream source
// =============================================================================
//
// Owns the socket and drives `ConnectionMachine`. Subscription changes arrive
// as commands over an unbounded channel, so `StreamHandle::subscribe` never
// blocks and never fails loudly: if the task is gone the request is dropped
// with a debug log.
//
// Parsed candles, state transitions and retry exhaustion leave the task as
// `StreamEvent`s; the application root forwards them into the store.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use super::machine::{Action, ConnectionMachine, ControlFrame};
use crate::error::MarketDataError;
use crate::feed::FeedAdapter;
use crate::runtime_config::ReconnectConfig;
use crate::types::{Candle, ConnectionState, Interval, SeriesKey};

/// Output of the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Candle {
        key: SeriesKey,
        candle: Candle,
        closed: bool,
    },
    State(ConnectionState),
    /// Reconnect budget spent for every key listed.
    Exhausted {
        keys: Vec<SeriesKey>,
        error: MarketDataError,
    },
}

/// Subscription control as seen by the store. Implementations must not
/// block and must not panic when the connection is already closed.
pub trait StreamControl: Send + Sync {
    fn subscribe(&self, key: &SeriesKey);
    fn unsubscribe(&self, key: &SeriesKey);
}

#[derive(Debug)]
enum Command {
    Subscribe(SeriesKey),
    Unsubscribe(SeriesKey),
    Shutdown,
}

/// Cheap, cloneable handle to a running connection task.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<ConnectionState>>,
}

impl StreamHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Close the socket and stop the task.
    pub fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_err() {
            debug!("stream task already stopped");
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            debug!(command = ?e.0, "stream task gone, dropping command");
        }
    }
}

impl StreamControl for StreamHandle {
    fn subscribe(&self, key: &SeriesKey) {
        self.send(Command::Subscribe(key.clone()));
    }

    fn unsubscribe(&self, key: &SeriesKey) {
        self.send(Command::Unsubscribe(key.clone()));
    }
}

/// The connection task state. Constructed and consumed by [`StreamConnection::spawn`].
pub struct StreamConnection {
    adapter: Arc<dyn FeedAdapter>,
    machine: ConnectionMachine,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    request_id: u64,
    last_error: Option<String>,
}

impl StreamConnection {
    /// Start the connection task on the current tokio runtime. Nothing is
    /// dialled until the first subscribe.
    pub fn spawn(
        adapter: Arc<dyn FeedAdapter>,
        policy: ReconnectConfig,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self::new(adapter, policy, events);
        let handle = StreamHandle {
            commands: tx,
            state: Arc::clone(&connection.state),
        };
        tokio::spawn(connection.run(rx));
        handle
    }

    fn new(
        adapter: Arc<dyn FeedAdapter>,
        policy: ReconnectConfig,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            adapter,
            machine: ConnectionMachine::new(policy),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events,
            request_id: 0,
            last_error: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut dial_at: Option<Instant> = None;

        loop {
            // ── Offline: wait for a subscribe or the backoff deadline ────
            let dial = match dial_at {
                Some(at) => tokio::select! {
                    _ = tokio::time::sleep_until(at) => true,
                    cmd = commands.recv() => {
                        if !self.handle_offline(cmd, &mut dial_at) {
                            return;
                        }
                        false
                    }
                },
                None => {
                    let cmd = commands.recv().await;
                    if !self.handle_offline(cmd, &mut dial_at) {
                        return;
                    }
                    false
                }
            };
            if !dial {
                continue;
            }
            dial_at = None;

            // ── Dial ─────────────────────────────────────────────────────
            self.machine.on_connecting();
            self.publish_state();
            let url = self.adapter.ws_url().to_string();
            info!(url = %url, source = %self.adapter.source(), "connecting to market stream");

            let ws_stream = match connect_async(url.as_str()).await {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    warn!(url = %url, error = %e, "market stream connect failed");
                    self.last_error = Some(e.to_string());
                    let actions = self.machine.on_closed();
                    self.publish_state();
                    self.apply_offline(actions, &mut dial_at);
                    continue;
                }
            };

            let (mut write, mut read) = ws_stream.split();
            let actions = self.machine.on_open();
            self.publish_state();
            info!(
                source = %self.adapter.source(),
                keys = self.machine.desired().len(),
                "market stream connected"
            );

            // ── Online: pump frames and commands ────────────────────────
            let mut alive = self.send_actions(&mut write, actions).await;
            while alive {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => self.on_frame(&text),
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                debug!(error = %e, "failed to send Pong");
                                alive = false;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "market stream closed by upstream");
                            alive = false;
                        }
                        // Binary / Pong / raw frames carry no OHLC data.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "market stream read error");
                            self.last_error = Some(e.to_string());
                            alive = false;
                        }
                        None => {
                            warn!("market stream ended");
                            alive = false;
                        }
                    },
                    cmd = commands.recv() => match cmd {
                        None | Some(Command::Shutdown) => {
                            let _ = write.send(Message::Close(None)).await;
                            self.machine.on_shutdown();
                            self.publish_state();
                            info!("market stream shut down");
                            return;
                        }
                        Some(Command::Subscribe(key)) => {
                            let actions = self.machine.subscribe(key);
                            alive = self.send_actions(&mut write, actions).await;
                        }
                        Some(Command::Unsubscribe(key)) => {
                            let actions = self.machine.unsubscribe(&key);
                            alive = self.send_actions(&mut write, actions).await;
                        }
                    }
                }
            }

            let actions = self.machine.on_closed();
            self.publish_state();
            self.apply_offline(actions, &mut dial_at);
        }
    }

    /// Returns `false` when the task should stop.
    fn handle_offline(&mut self, cmd: Option<Command>, dial_at: &mut Option<Instant>) -> bool {
        match cmd {
            None | Some(Command::Shutdown) => {
                info!("market stream task stopping");
                false
            }
            Some(Command::Subscribe(key)) => {
                let actions = self.machine.subscribe(key);
                self.publish_state();
                self.apply_offline(actions, dial_at);
                true
            }
            Some(Command::Unsubscribe(key)) => {
                let actions = self.machine.unsubscribe(&key);
                self.apply_offline(actions, dial_at);
                true
            }
        }
    }

    fn apply_offline(&mut self, actions: Vec<Action>, dial_at: &mut Option<Instant>) {
        for action in actions {
            match action {
                Action::Connect => *dial_at = Some(Instant::now()),
                Action::ScheduleReconnect(delay) => {
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.machine.attempt(),
                        "market stream reconnect scheduled"
                    );
                    *dial_at = Some(Instant::now() + delay);
                }
                Action::Exhausted => {
                    *dial_at = None;
                    let reason = self
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "connection closed".to_string());
                    error!(reason = %reason, "market stream retry budget exhausted");
                    let keys: Vec<SeriesKey> = self.machine.desired().iter().cloned().collect();
                    self.emit(StreamEvent::Exhausted {
                        keys,
                        error: MarketDataError::Network(format!("reconnect attempts exhausted: {reason}")),
                    });
                }
                // Frames are only produced while connected.
                Action::Send(frame) => debug!(frame = ?frame, "dropping control frame while offline"),
            }
        }
    }

    /// Write control frames. Returns `false` if the socket is broken; a
    /// failed send is logged and never surfaced to callers.
    async fn send_actions<S>(&mut self, write: &mut S, actions: Vec<Action>) -> bool
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        for action in actions {
            let Action::Send(frame) = action else {
                continue;
            };
            for text in self.encode(&frame) {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!(error = %e, frame = ?frame, "failed to send control frame");
                    self.last_error = Some(e.to_string());
                    return false;
                }
            }
        }
        true
    }

    /// Encode a control frame, one message per interval (some upstreams scope
    /// a subscription to a single interval).
    fn encode(&mut self, frame: &ControlFrame) -> Vec<String> {
        let (keys, subscribe) = match frame {
            ControlFrame::Subscribe(keys) => (keys, true),
            ControlFrame::Unsubscribe(keys) => (keys, false),
        };

        let mut by_interval: BTreeMap<Interval, Vec<SeriesKey>> = BTreeMap::new();
        for key in keys {
            by_interval.entry(key.interval).or_default().push(key.clone());
        }

        let mut out = Vec::with_capacity(by_interval.len());
        for group in by_interval.values() {
            self.request_id += 1;
            let encoded = if subscribe {
                self.adapter.subscribe_frame(group, self.request_id)
            } else {
                self.adapter.unsubscribe_frame(group, self.request_id)
            };
            match encoded {
                Ok(text) => out.push(text),
                Err(e) => warn!(error = %e, "failed to encode control frame"),
            }
        }
        out
    }

    /// Parse one text frame and route it to its series. Malformed frames are
    /// logged and dropped; they never close the connection.
    fn on_frame(&mut self, text: &str) {
        match self.adapter.parse_tick(text) {
            Ok(Some(update)) => match self.route(&update.upstream_symbol, update.interval) {
                Some(key) => {
                    trace!(key = %key, close = update.candle.close, closed = update.closed, "candle update");
                    self.emit(StreamEvent::Candle {
                        key,
                        candle: update.candle,
                        closed: update.closed,
                    });
                }
                None => debug!(
                    symbol = %update.upstream_symbol,
                    interval = %update.interval,
                    "update for unsubscribed series dropped"
                ),
            },
            Ok(None) => trace!("non-OHLC frame ignored"),
            Err(e) => warn!(error = %e, "dropping malformed market frame"),
        }
    }

    fn route(&self, upstream_symbol: &str, interval: Interval) -> Option<SeriesKey> {
        self.machine
            .desired()
            .iter()
            .find(|k| {
                k.interval == interval
                    && self.adapter.normalize_symbol(&k.symbol).eq_ignore_ascii_case(upstream_symbol)
            })
            .cloned()
    }

    fn publish_state(&mut self) {
        let next = self.machine.state();
        let changed = {
            let mut current = self.state.write();
            let changed = *current != next;
            *current = next;
            changed
        };
        if changed {
            debug!(state = %next, "market stream state changed");
            self.emit(StreamEvent::State(next));
        }
    }

    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            trace!("stream event receiver dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{BinanceAdapter, KrakenAdapter};

    fn key(sym: &str, iv: Interval) -> SeriesKey {
        SeriesKey::new(sym, iv).unwrap()
    }

    fn connection(
        adapter: Arc<dyn FeedAdapter>,
    ) -> (StreamConnection, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamConnection::new(adapter, ReconnectConfig::default(), tx), rx)
    }

    const KLINE: &str = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","s":"BTCUSDT","k":{"t":60000,"i":"1m","o":"1","h":"2","l":"0.5","c":"1.5","v":"3","x":true}}}"#;

    #[test]
    fn frames_route_to_subscribed_series() {
        let (mut conn, mut rx) = connection(Arc::new(BinanceAdapter::new()));
        conn.machine.subscribe(key("BTCUSDT", Interval::M1));

        conn.on_frame(KLINE);
        match rx.try_recv().unwrap() {
            StreamEvent::Candle { key: k, candle, closed } => {
                assert_eq!(k, key("BTCUSDT", Interval::M1));
                assert_eq!(candle.time, 60_000);
                assert!(closed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn malformed_and_unrouted_frames_are_dropped() {
        let (mut conn, mut rx) = connection(Arc::new(BinanceAdapter::new()));
        conn.machine.subscribe(key("ETHUSDT", Interval::M1));

        conn.on_frame("{garbage");
        conn.on_frame(r#"{"result":null,"id":1}"#);
        conn.on_frame(KLINE); // BTCUSDT is not subscribed
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn kraken_frames_route_through_symbol_mapping() {
        let (mut conn, mut rx) = connection(Arc::new(KrakenAdapter::new()));
        conn.machine.subscribe(key("BTCUSDT", Interval::M5));

        conn.on_frame(r#"[1,["1700000010.0","1700000300.0","1","2","0.5","1.5","1.2","3",4],"ohlc-5","XBT/USDT"]"#);
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Candle { .. })));
    }

    #[test]
    fn encode_splits_frames_per_interval() {
        let (mut conn, _rx) = connection(Arc::new(KrakenAdapter::new()));
        let frames = conn.encode(&ControlFrame::Subscribe(vec![
            key("BTCUSD", Interval::M1),
            key("ETHUSD", Interval::M1),
            key("BTCUSD", Interval::H1),
        ]));
        assert_eq!(frames.len(), 2);
        assert_eq!(conn.request_id, 2);
    }

    #[test]
    fn exhaustion_notifies_desired_keys() {
        let (mut conn, mut rx) = connection(Arc::new(BinanceAdapter::new()));
        conn.machine = ConnectionMachine::new(ReconnectConfig {
            base_delay_ms: 1,
            max_attempts: 0,
            max_delay_ms: None,
        });
        conn.machine.subscribe(key("BTCUSDT", Interval::M1));
        conn.machine.on_connecting();
        conn.last_error = Some("refused".into());

        let mut dial_at = None;
        let actions = conn.machine.on_closed();
        conn.apply_offline(actions, &mut dial_at);

        assert!(dial_at.is_none());
        match rx.try_recv().unwrap() {
            StreamEvent::Exhausted { keys, error } => {
                assert_eq!(keys, vec![key("BTCUSDT", Interval::M1)]);
                assert!(error.is_network());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_is_best_effort_after_task_stops() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = StreamConnection::spawn(Arc::new(BinanceAdapter::new()), ReconnectConfig::default(), tx);
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        handle.shutdown();
        tokio::task::yield_now().await;
        // Neither call may panic once the task is gone.
        handle.unsubscribe(&key("BTCUSDT", Interval::M1));
        handle.shutdown();
    }
}
