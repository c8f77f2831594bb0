//! Fee ledger and event log.

pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::InMemoryLedgerStore;
pub use repository::LedgerRepository;
pub use store::LedgerStore;
