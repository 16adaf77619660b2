//! Ledger module: chart of accounts, journal templates and posting

pub mod account;
pub mod core;
pub mod posting;
pub mod templates;

pub use account::*;
pub use core::*;
pub use posting::*;
pub use templates::*;
