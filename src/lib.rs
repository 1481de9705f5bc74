//! Agent dispatch: task routing and scheduling for a fleet of agent workers.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod router;
pub mod service;
pub mod task;
pub mod worker;
