//! Convoy Events - In-process pub/sub for pipeline observers
//!
//! One bus per orchestrator. Publishers never block on slow observers:
//! every subscriber owns a bounded buffer with an overflow policy, either
//! `drop_oldest` (default, for dashboards that only need the latest
//! picture) or `disconnect` (for strict observers that would rather lose
//! the stream than miss an event silently).
//!
//! The bus does not persist anything itself, but every event is written
//! through the audit gateway before fan-out returns, so the durable
//! trail is always at least as complete as what any observer saw.

#![deny(unsafe_code)]

mod bus;

pub use bus::{EventBus, EventBusConfig, OverflowPolicy, Subscription};
