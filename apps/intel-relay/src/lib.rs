pub mod ai;
pub mod bridge;
pub mod broadcaster;
pub mod bus;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod liveness;
pub mod log_throttle;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod storage;
pub mod tasks;
pub mod websocket;
pub mod worker;
