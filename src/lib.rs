pub mod config;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod freshness;
pub mod intent;
pub mod observations;
pub mod output;
pub mod period;
pub mod scheduler;
pub mod service;
pub mod sources;
pub mod state;
pub mod stats;
pub mod subscriptions;
pub mod supervisor;
pub mod transport;
