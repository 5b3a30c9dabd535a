// =============================================================================
// Connection state machine — pure, timer-free
// =============================================================================
//
//   Disconnected ──connect──▶ Connecting ──open──▶ Connected
//        ▲                        │                    │
//        └──── backoff delay ◀────┴──── close/error ◀──┘
//                 │
//                 └── budget exhausted ──▶ Error (until the next subscribe)
//
// The machine never sleeps or touches a socket. Every input returns the
// actions the driver must perform, so reconnect behaviour is testable
// without real timers.
// =============================================================================

use std::collections::BTreeSet;
use std::time::Duration;

use crate::runtime_config::ReconnectConfig;
use crate::types::{ConnectionState, SeriesKey};

/// `base * 2^attempt`, capped by `max_delay_ms` when configured.
pub fn reconnect_delay(policy: &ReconnectConfig, attempt: u32) -> Duration {
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    let ms = policy.base_delay_ms.saturating_mul(factor);
    let ms = match policy.max_delay_ms {
        Some(cap) => ms.min(cap),
        None => ms,
    };
    Duration::from_millis(ms)
}

/// Protocol-level subscription change to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Subscribe(Vec<SeriesKey>),
    Unsubscribe(Vec<SeriesKey>),
}

/// Side effect requested from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dial now.
    Connect,
    Send(ControlFrame),
    /// Dial again after the delay.
    ScheduleReconnect(Duration),
    /// Retry budget spent; notify listeners.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectConfig,
    state: ConnectionState,
    attempt: u32,
    /// A dial is already queued (immediate or after backoff).
    connect_pending: bool,
    /// Every key the upstream should be streaming. Re-sent in full on open.
    desired: BTreeSet<SeriesKey>,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectConfig) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            connect_pending: false,
            desired: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn desired(&self) -> &BTreeSet<SeriesKey> {
        &self.desired
    }

    pub fn subscribe(&mut self, key: SeriesKey) -> Vec<Action> {
        let added = self.desired.insert(key.clone());

        match self.state {
            ConnectionState::Connected if added => vec![Action::Send(ControlFrame::Subscribe(vec![key]))],
            ConnectionState::Connected => Vec::new(),
            // Buffered; flushed by `on_open`.
            ConnectionState::Connecting => Vec::new(),
            ConnectionState::Disconnected => self.request_connect(),
            ConnectionState::Error => {
                self.attempt = 0;
                self.state = ConnectionState::Disconnected;
                self.request_connect()
            }
        }
    }

    pub fn unsubscribe(&mut self, key: &SeriesKey) -> Vec<Action> {
        let removed = self.desired.remove(key);
        if removed && self.state == ConnectionState::Connected {
            vec![Action::Send(ControlFrame::Unsubscribe(vec![key.clone()]))]
        } else {
            Vec::new()
        }
    }

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
        self.connect_pending = false;
    }

    /// Socket opened: reset the backoff and replay the full key set, since
    /// the upstream has no memory of earlier subscriptions.
    pub fn on_open(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Connected;
        self.attempt = 0;

        if self.desired.is_empty() {
            Vec::new()
        } else {
            let keys = self.desired.iter().cloned().collect();
            vec![Action::Send(ControlFrame::Subscribe(keys))]
        }
    }

    /// Dial failure or a dropped connection.
    pub fn on_closed(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Disconnected;
        self.connect_pending = false;

        // Nobody is listening; stay down until the next subscribe.
        if self.desired.is_empty() {
            return Vec::new();
        }

        if self.attempt < self.policy.max_attempts {
            let delay = reconnect_delay(&self.policy, self.attempt);
            self.attempt += 1;
            self.connect_pending = true;
            vec![Action::ScheduleReconnect(delay)]
        } else {
            self.state = ConnectionState::Error;
            vec![Action::Exhausted]
        }
    }

    /// Local close: no retry, nothing pending.
    pub fn on_shutdown(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.connect_pending = false;
    }

    fn request_connect(&mut self) -> Vec<Action> {
        if self.connect_pending {
            Vec::new()
        } else {
            self.connect_pending = true;
            vec![Action::Connect]
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
