//! Fixed-window rate limit counters and the protocol that maintains them.

mod backend;
mod counter;
mod key;
mod rate;
mod runner;
mod window;

pub use backend::{Store, Transaction, Ttl};
pub use counter::{CounterOptions, WindowCounter, WindowState, DEFAULT_MAX_RETRY, DEFAULT_PREFIX};
pub use key::WindowKey;
pub use rate::{PeriodUnit, Rate};
pub use runner::{CallContext, CancelHandle, TransactionRunner, UnitOfWork};
pub use window::{Increment, Peek, Reset, WindowReading};
