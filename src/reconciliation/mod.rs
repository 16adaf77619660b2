//! Reconciliation of processor records, bank settlements and the ledger

pub mod engine;
pub mod gateway;
pub mod matching;
pub mod records;
pub mod returns;

pub use engine::*;
pub use gateway::{call_with_retry, load_bank_records, load_processor_records};
pub use matching::*;
pub use records::*;
pub use returns::*;
