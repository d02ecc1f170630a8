//! Napgate - puts idle containers to sleep and wakes them on demand
//!
//! This library provides:
//! - A hierarchical task tree with reason-carrying cancellation and bounded,
//!   idempotent draining, used by every long-lived component
//! - Idle watchers that stop, pause or kill a backend container after a
//!   period without traffic and start it again when a request arrives
//! - Container lifecycle providers for docker, docker behind a remote agent
//!   and Proxmox LXC
//! - Backend health probes (HTTP, raw TCP, agent-relayed)
//! - A route provider that keeps watchers in line with the configuration,
//!   and an admin API exposing their status

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod events;
pub mod health;
pub mod provider;
pub mod routes;
pub mod task;
pub mod watcher;
