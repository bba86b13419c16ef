//! Shared types for the netlab test orchestration system.
//!
//! Device models and the device error taxonomy live here, together with
//! the request, reply and event frames the controller and the per-machine
//! agent exchange. The [`channel::Channel`] trait abstracts the transport
//! that carries them.

pub mod channel;
pub mod error;
pub mod ids;
pub mod models;
pub mod protocol;
