//! Shared runtime state for loyal-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The background tasks
//! here only move messages onto the SSE bus.

use std::sync::Arc;
use std::time::Duration;

use loyal_db::Storage;
use loyal_reconcile::ReconcileEvent;
use loyal_schemas::{OrderStatus, Points, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
///
/// Order events carry their owner; a stream only relays the caller's own
/// events (see [`BusMsg::visible_to`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat {
        ts_millis: i64,
    },
    OrderStatus {
        number: String,
        user_id: UserId,
        from: OrderStatus,
        to: OrderStatus,
    },
    Credited {
        number: String,
        user_id: UserId,
        amount: Points,
    },
}

impl BusMsg {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::OrderStatus { .. } => "order_status",
            BusMsg::Credited { .. } => "credited",
        }
    }

    /// Whether `user` may see this message on their stream.
    pub fn visible_to(&self, user: UserId) -> bool {
        match self {
            BusMsg::Heartbeat { .. } => true,
            BusMsg::OrderStatus { user_id, .. } | BusMsg::Credited { user_id, .. } => {
                *user_id == user
            }
        }
    }

    /// Bus form of a reconciler event. Tick reports span every user and
    /// stay in the logs.
    pub fn from_event(ev: ReconcileEvent) -> Option<Self> {
        match ev {
            ReconcileEvent::StatusChanged {
                number,
                user_id,
                from,
                to,
            } => Some(BusMsg::OrderStatus {
                number,
                user_id,
                from,
                to,
            }),
            ReconcileEvent::Credited {
                number,
                user_id,
                amount,
            } => Some(BusMsg::Credited {
                number,
                user_id,
                amount,
            }),
            ReconcileEvent::Tick(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    /// Static build metadata.
    pub build: BuildInfo,
    /// Orders, balances and withdrawals. Postgres or in-memory.
    pub storage: Arc<dyn Storage>,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "loyal-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            storage,
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Spawn a task that republishes reconciler events on the SSE bus. Ends when
/// the reconciler drops its sender.
pub fn spawn_event_forwarder(
    mut events: broadcast::Receiver<ReconcileEvent>,
    bus: broadcast::Sender<BusMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => {
                    if let Some(msg) = BusMsg::from_event(ev) {
                        let _ = bus.send(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
