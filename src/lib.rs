//! Remote dispatch: per-session change notification for a live simulation.
//!
//! The simulation announces coarse tags ("cars", "trainset-4") whenever its
//! state changes. Each remote client owns a session that accumulates those
//! tags as a set; a poll drains the set (or waits for one tag) and resolves
//! each tag to its current payload through the simulation thread.

pub mod api;
pub mod bus;
pub mod config;
pub mod executor;
pub mod resolve;
pub mod session;
pub mod shutdown;
pub mod signal;
pub mod sim;
pub mod tag;
