//! netlab test machine agent.
//!
//! Mirrors the kernel's network interfaces in a [`registry::DeviceRegistry`],
//! keeps it convergent through kernel events and periodic rescans, and
//! exposes devices, jobs and system options to the controller over a
//! WebSocket command channel.

pub mod config;
pub mod device;
pub mod handler;
pub mod jobs;
pub mod kernel;
pub mod local;
pub mod probe;
pub mod pump;
pub mod registry;
pub mod server;
pub mod sysconfig;
