//! Subscription and resend engine for the rill messaging protocol.
//!
//! # Purpose
//! Multiplexes logical subscriptions over one shared connection, drives the
//! per-subscription lifecycle through the request/response protocol,
//! coalesces subscribers per stream partition, repairs ordering gaps with
//! bounded resends, verifies each delivery once, and replays subscriptions
//! across reconnects.
//!
//! The wire connection itself (framing, TLS, reconnect backoff) and session
//! token acquisition are external collaborators behind the [`Connection`]
//! and [`auth::TokenProvider`] traits.
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
mod correlator;
mod engine;
mod ordering;
mod registry;
mod resend;
pub mod subscription;
mod verifier;

mod error;


pub use client::{Client, ClientEvent, ResendOptions, SubscribeOptions, SubscriptionInfo};
pub use config::{ClientConfig, SignaturePolicy};
pub use connection::{Connection, ConnectionEvent};
pub use error::{ClientError, Result};
pub use ordering::ChainKey;
pub use resend::ResendOption;
pub use subscription::{SubState, Subscription, SubscriptionEvent, SubscriptionKey};

pub use auth::{Auth, TokenProvider};
