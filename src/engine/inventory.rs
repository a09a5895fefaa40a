//! Inventory ledger: the copy counters of one title.
//!
//! Every mutation checks its bound before touching the counters, so
//! `0 <= available <= total` holds for every value this type can reach.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    /// No copy left on the shelf.
    OutOfStock,
    /// Every copy is already on the shelf.
    CapacityExceeded,
    /// A new total below the number of copies currently lent out.
    BelowOnLoan { on_loan: u32 },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::OutOfStock => write!(f, "out of stock"),
            LedgerError::CapacityExceeded => write!(f, "all copies already on the shelf"),
            LedgerError::BelowOnLoan { on_loan } => {
                write!(f, "total below the {on_loan} copies on loan")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    total: u32,
    available: u32,
}

impl Inventory {
    /// A fresh title: every copy on the shelf.
    pub fn new(total: u32) -> Self {
        Self { total, available: total }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn on_loan(&self) -> u32 {
        self.total - self.available
    }

    pub fn decrease(&mut self) -> Result<(), LedgerError> {
        if self.available == 0 {
            return Err(LedgerError::OutOfStock);
        }
        self.available -= 1;
        Ok(())
    }

    pub fn increase(&mut self) -> Result<(), LedgerError> {
        if self.available >= self.total {
            return Err(LedgerError::CapacityExceeded);
        }
        self.available += 1;
        Ok(())
    }

    /// Whether `increase` would succeed.
    pub fn can_increase(&self) -> bool {
        self.available < self.total
    }

    /// Change the number of copies owned, keeping every lent copy lent.
    pub fn resize(&mut self, total: u32) -> Result<(), LedgerError> {
        let on_loan = self.on_loan();
        if total < on_loan {
            return Err(LedgerError::BelowOnLoan { on_loan });
        }
        self.total = total;
        self.available = total - on_loan;
        Ok(())
    }
}
