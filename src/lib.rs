//! Now-playing announcer for streaming radio stations.
//!
//! `onair` keeps a WebSocket subscription to a radio broadcast service, turns
//! its now-playing updates into announcements and reconnects on its own when
//! the connection is lost. The entry point is [`service::Service`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod announce;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod reconnect;
pub mod service;
pub mod signal;
pub mod status;
pub mod store;
pub mod template;
pub mod transport;
