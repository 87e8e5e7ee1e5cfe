//! DeafNav relay: bracelet telemetry in over MQTT, transit status polled
//! from external providers, alerts and live updates pushed to rider UIs.

pub mod alerts;
pub mod board;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod ingress;
pub mod models;
pub mod mqtt;
pub mod persistence;
pub mod pipeline;
pub mod poller;
pub mod providers;
pub mod state;

#[cfg(test)]
mod test_support;
