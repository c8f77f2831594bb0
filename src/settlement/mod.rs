// Payouts: threshold scan, value transfer, pending -> paid
pub mod evm;
pub mod payout;
pub mod scheduler;

use async_trait::async_trait;

use crate::error::SettlementError;

pub use evm::EvmSettlementClient;
pub use payout::PayoutEngine;
pub use scheduler::PayoutScheduler;

/// Value transfer to a worker address
///
/// INVARIANTS:
/// - Returns the transaction id only once the transfer has been submitted
/// - Fails with `FeeRateTooHigh` before any signing when the network fee rate is over the cap
/// - `SubmissionUnknown` means value may have moved; callers must not retry blindly
#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Send `amount` wei to `recipient`, returning the transaction id
    async fn send(&self, amount: i64, recipient: &str) -> Result<String, SettlementError>;
}
