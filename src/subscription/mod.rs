//! Subscription registry and admission control.
//!
//! [`SubscriptionManager`] tracks which clients listen to which
//! (symbol, event type) streams, enforces the total cap and the per-second
//! rate, and moves subscriptions through their lifecycle as the venue
//! confirms them and the connection comes and goes.

pub mod manager;

pub use manager::{
    is_valid_symbol, ConnectionCallback, StateChangeCallback, SubscriptionEntry,
    SubscriptionManager,
};
