//! netlab controller library.
//!
//! Leases test machines from pools, binds a recipe's logical hosts and
//! interfaces to them, runs the recipe and always tears the match down
//! again. Each machine is driven through its agent's command channel.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod host;
pub mod hypervisor;
pub mod machine;
pub mod macpool;
pub mod mapper;
pub mod pool;
pub mod provision;
pub mod recipe;
pub mod ws;
