//! # Mesh manager core
//!
//! A persistent bridge between a LoRa mesh radio (speaking length-prefixed
//! protobuf over TCP) and the local consumers of that mesh: a historical
//! store, two background schedulers, a push notifier, and a virtual-node
//! replay fan-out. The REST surface, the push backend, and the
//! virtual-node server are external collaborators this crate talks to
//! through narrow trait seams — see [`push`] and [`virtual_node`] — not
//! components it owns.

pub mod config;
pub mod error;
pub mod manager;
pub mod protobuf;
pub mod push;
pub mod store;
pub mod transport;
pub mod virtual_node;
