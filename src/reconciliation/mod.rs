pub mod engine;
pub mod events;
pub mod fees;

pub use engine::{BatchSummary, ReconciliationEngine};
pub use events::RawEvent;
pub use fees::Commission;
