//! # Settlement Core
//!
//! Payment settlement ledger and reconciliation engine: payment events are
//! turned into balanced journal entries through templates, posted
//! idempotently, and reconciled three ways against processor records and
//! bank settlements.
//!
//! ## Features
//!
//! - **Journal templates**: Closed set of payment event types, priority-ordered
//!   templates and previews
//! - **Double-entry posting**: Integer minor units, idempotency keys, batches and reversals
//! - **Reconciliation**: Deterministic matching of processor, bank and ledger
//!   records within date tolerances
//! - **ACH returns**: Automatic reversal and fee booking inside the return window
//! - **Exception queue**: Open, UnderReview, Resolved and WrittenOff with optimistic transitions
//! - **Audit log**: Append-only before/after snapshots of every state change
//! - **Storage abstraction**: Database-agnostic design with trait-based storage
//!
//! ## Quick Start
//!
//! ```rust
//! use settlement_core::{
//!     utils::{MemoryBankFeed, MemoryProcessorGateway, MemoryStorage},
//!     EngineConfig, InMemoryChart, SettlementEngine, TransactionData, TransactionType,
//! };
//! use chrono::NaiveDate;
//! use std::sync::Arc;
//!
//! # async fn run() -> settlement_core::LedgerResult<()> {
//! let config = EngineConfig::default();
//! let chart = Arc::new(InMemoryChart::standard(&config.accounts)?);
//! let engine = SettlementEngine::new(
//!     MemoryStorage::new(),
//!     chart,
//!     Arc::new(MemoryProcessorGateway::new(100)),
//!     Arc::new(MemoryBankFeed::new()),
//!     config,
//! )?;
//!
//! let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
//! let payment = TransactionData::new("py_1", date, "USD").amount(150_000);
//! let entry = engine
//!     .post_transaction("system", TransactionType::AchPayment, &payment)
//!     .await?;
//! assert!(entry.is_balanced());
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod exceptions;
pub mod ledger;
pub mod reconciliation;
pub mod telemetry;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditLog};
pub use config::*;
pub use engine::SettlementEngine;
pub use exceptions::ExceptionService;
pub use ledger::*;
pub use reconciliation::*;
pub use traits::*;
pub use types::*;
