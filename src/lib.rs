//! Magnus Opus — background task supervision and context aggregation.

pub mod config;
pub mod context;
pub mod error;
pub mod routing;
pub mod session;
pub mod worker;
