use crate::error::{AppError, LedgerError};

/// Pool commission in whole percent, 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Commission(u8);

impl Commission {
    pub fn try_from_percent(percent: u8) -> Result<Self, AppError> {
        if percent > 100 {
            return Err(AppError::InvalidInput(format!(
                "commission must be between 0 and 100, got {}",
                percent
            )));
        }
        Ok(Self(percent))
    }

    pub fn percent(&self) -> u8 {
        self.0
    }

    /// Worker share of a gross fee: `floor(fees * (100 - commission) / 100)`.
    ///
    /// Computed in i128 so the intermediate product cannot overflow; the result
    /// is never larger than `fees` and always fits back into i64.
    pub fn apply(&self, fees: i64) -> Result<i64, LedgerError> {
        if fees < 0 {
            return Err(LedgerError::NegativeAmount(fees));
        }
        let share = i128::from(fees) * i128::from(100 - self.0) / 100;
        Ok(share as i64)
    }
}
