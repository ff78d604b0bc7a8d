//! Offline resilience for the B2B ordering portal.
//!
//! Requests are classified into caching strategies, the application shell is
//! kept in versioned cache generations, and orders placed while offline wait
//! in a durable outbox until a sync pass delivers them.

pub mod cache;
pub mod clients;
pub mod config;
pub mod connectivity;
mod db;
pub mod error;
pub mod event;
pub mod http;
pub mod logging;
pub mod network;
pub mod outbox;
pub mod push;
pub mod routes;
pub mod strategy;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use worker::OfflineWorker;
