//! Student roster index and enrollment-status workflow, served to a desktop
//! front end as a line-delimited JSON sidecar.

pub mod config;
pub mod db;
pub mod events;
pub mod ipc;
pub mod model;
pub mod promotion;
pub mod roster;
pub mod session;
pub mod store;
pub mod undo;
