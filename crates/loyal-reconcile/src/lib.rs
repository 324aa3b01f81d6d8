//! loyal-reconcile
//!
//! Background reconciliation of outstanding orders against the accrual
//! authority.
//!
//! Every tick:
//! - credits PROCESSED orders that never had their accrual applied (crash
//!   recovery; crediting is idempotent per order),
//! - polls the authority for each NEW or PROCESSING order, a bounded number
//!   at a time,
//! - moves status forward, settles and credits on PROCESSED,
//! - schedules one deferred re-check per rate-limited order.
//!
//! A failure on one order never aborts the tick. All background work stops
//! when the [`Shutdown`] signal fires.

mod engine;
mod shutdown;
mod task;
mod types;

pub use engine::Reconciler;
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use task::ReconcileHandle;
pub use types::*;
