#![forbid(unsafe_code)]

pub mod http;
pub mod reconcile_task;
pub mod roster;
pub mod routes;
pub mod state;
