//! Agent relay: a durable inbox, a job scheduler and a heartbeat in front of
//! an external command-line agent.

pub mod agent;
pub mod channels;
pub mod config;
pub mod context;
pub mod cron;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod inbox;
pub mod persist;
pub mod workspace;

#[cfg(test)]
mod testing;
