//! Utility modules

pub mod calendar;
pub mod cancel;
pub mod memory_gateway;
pub mod memory_storage;
pub mod money;
pub mod validation;

pub use cancel::*;
pub use memory_gateway::*;
pub use memory_storage::*;
pub use validation::*;
