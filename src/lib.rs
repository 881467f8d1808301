//! Tron custody: USDT held for many users under one derived key tree.
//!
//! # Architecture
//!
//! ```text
//! Engine (entry point)
//!   │
//!   ├── KeyRing (mnemonic → m/44'/195'/0'/0/{i} → Tron addresses)
//!   │     └── AddressPool (FREE → ASSIGNED → ACTIVE → RETIRED)
//!   │
//!   ├── DepositScanner (Transfer events → DepositRecord)
//!   ├── SweepOrchestrator (gas top-up → sweep to master → ledger credit)
//!   ├── Ledger (append-only journal, idempotency keys)
//!   ├── WithdrawalService / WithdrawalQueue / WithdrawalProcessor
//!   │
//!   └── Scheduler (one poller task per job, emergency stop aware)
//! ```
//!
//! # Collaborators
//!
//! | Trait | In-memory | Production |
//! |-------|-----------|------------|
//! | `ChainGateway` | `MemoryChain` | `TronGridGateway` (`trongrid` feature) |
//! | `Store` | `MemoryStore` | relational store |
//! | `KvStore` | `MemoryKv` | shared KV with expiry |
//! | `NotificationSink` / `AuditSink` | `CollectingSink` | `TracingNotifier` / `TracingAudit` |
//!
//! # Usage
//!
//! ```ignore
//! use tron_custody::{Engine, EngineConfig, KeyRing, SeedVault, Network};
//!
//! let seed = SeedVault::open(&path, &passphrase)?;
//! let engine = Engine::new(EngineConfig::new(Network::Nile), KeyRing::new(seed)?, chain, store, kv, users, notifier, audit)?;
//! engine.start().await?;
//! let handles = engine.scheduler().spawn(&shutdown);
//!
//! let address = engine.assign_address(user).await?;
//! let request = engine.submit_withdrawal(user, "T...", amount, &password).await?;
//! ```

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod kv;
pub mod ledger;
pub mod logging;
pub mod pool;
pub mod runtime;
pub mod scanner;
pub mod scheduler;
pub mod signer;
pub mod sinks;
pub mod store;
pub mod sweep;
pub mod units;
pub mod users;
pub mod withdrawal;

// =============================================================================
// Re-exports
// =============================================================================
pub use chain::{Asset, ChainGateway, MemoryChain, TransferEvent, TxOutcome};
#[cfg(feature = "trongrid")]
pub use chain::TronGridGateway;
pub use config::{EngineConfig, Network};
pub use engine::{Engine, Health};
pub use error::{CustodyError, CustodyResult, ErrorKind};
pub use keys::{is_valid_address, KeyRing, MasterSeed, SeedVault, TronAddress};
pub use kv::{KvStore, MemoryKv};
pub use ledger::Ledger;
pub use runtime::{install_signal_handlers, EmergencyStop, Shutdown};
pub use scheduler::{Job, Scheduler};
pub use sinks::{AuditSink, CollectingSink, NotificationSink, TracingAudit, TracingNotifier};
pub use store::{MemoryStore, Store, UserId};
pub use users::{StaticUsers, UserDirectory};
