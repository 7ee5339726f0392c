use candid::CandidType;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum ReserveHealth {
    Healthy,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for ReserveHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ReserveHealth::Healthy => "Healthy",
            ReserveHealth::Warning => "Warning",
            ReserveHealth::Critical => "Critical",
            ReserveHealth::Emergency => "Emergency",
        };
        write!(f, "{}", label)
    }
}

/// The bridge-owned destination-chain liquidity pool. Every mutation goes
/// through the methods below inside one storage critical section, which is
/// what keeps `locked <= balance` and `daily_used <= daily_limit` true.
#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct ReserveState {
    /// Total wei owned by the bridge on the destination chain.
    pub balance: u64,
    /// Wei reserved by Active quotes and in-flight settlements.
    pub locked: u64,
    pub threshold_warning: u64,
    pub threshold_critical: u64,
    pub daily_limit: u64,
    pub daily_used: u64,
    /// UTC day number (unix seconds / 86 400) the daily counter belongs to.
    pub day_anchor: u64,
    pub paused: bool,
    pub last_topup: u64,
    pub total_deposited: u64,
    pub total_committed: u64,
}

impl Default for ReserveState {
    fn default() -> Self {
        ReserveState {
            balance: 0,
            locked: 0,
            threshold_warning: 500_000_000_000_000_000,  // 0.5 ETH
            threshold_critical: 100_000_000_000_000_000, // 0.1 ETH
            daily_limit: 10_000_000_000_000_000_000,     // 10 ETH
            daily_used: 0,
            day_anchor: 0,
            paused: false,
            last_topup: 0,
            total_deposited: 0,
            total_committed: 0,
        }
    }
}

impl ReserveState {
    pub fn available(&self) -> u64 {
        self.balance.saturating_sub(self.locked)
    }

    pub fn health(&self) -> ReserveHealth {
        if self.paused || self.available() == 0 {
            ReserveHealth::Emergency
        } else if self.available() > self.threshold_warning {
            ReserveHealth::Healthy
        } else if self.available() > self.threshold_critical {
            ReserveHealth::Warning
        } else {
            ReserveHealth::Critical
        }
    }

    /// Lazily reset the daily counter when the wall clock crosses UTC
    /// midnight. Called at the top of every mutating operation.
    pub fn roll_day(&mut self, now_sec: u64) {
        let today = now_sec / SECONDS_PER_DAY;
        if today != self.day_anchor {
            self.day_anchor = today;
            self.daily_used = 0;
        }
    }

    pub fn daily_remaining(&self) -> u64 {
        self.daily_limit.saturating_sub(self.daily_used)
    }

    /// Read-only view of the daily remainder that accounts for a pending
    /// UTC-day rollover, for gates that run before any mutation.
    pub fn daily_remaining_at(&self, now_sec: u64) -> u64 {
        if now_sec / SECONDS_PER_DAY != self.day_anchor {
            self.daily_limit
        } else {
            self.daily_remaining()
        }
    }

    /// Reserve `amount` wei for an Active quote. The daily counter is charged
    /// here rather than at commit so two quotes locked in the same day can
    /// never jointly overrun the limit.
    pub fn lock(&mut self, amount: u64, now_sec: u64) -> BridgeResult<()> {
        self.roll_day(now_sec);
        if self.paused {
            return Err(BridgeError::ReservePaused);
        }
        if self.available() < amount {
            return Err(BridgeError::InsufficientReserve {
                required: amount,
                available: self.available(),
            });
        }
        if self.daily_used.saturating_add(amount) > self.daily_limit {
            return Err(BridgeError::DailyLimitExceeded {
                requested: amount,
                remaining: self.daily_remaining(),
            });
        }
        self.locked += amount;
        self.daily_used += amount;
        Ok(())
    }

    /// Release a reservation (quote expired or failed before completion).
    /// Idempotent on zero and saturating, so a double release cannot
    /// underflow the counters.
    pub fn unlock(&mut self, amount: u64, now_sec: u64) {
        self.roll_day(now_sec);
        self.locked = self.locked.saturating_sub(amount);
        self.daily_used = self.daily_used.saturating_sub(amount);
    }

    /// Spend a previously locked amount after a Completed settlement.
    pub fn commit(&mut self, amount: u64, now_sec: u64) {
        self.roll_day(now_sec);
        let spend = amount.min(self.locked).min(self.balance);
        self.balance -= spend;
        self.locked -= spend;
        self.total_committed += spend;
    }

    pub fn topup(&mut self, amount: u64, now_sec: u64) {
        self.roll_day(now_sec);
        self.balance = self.balance.saturating_add(amount);
        self.total_deposited = self.total_deposited.saturating_add(amount);
        self.last_topup = now_sec;
    }

    pub fn set_thresholds(&mut self, warning: u64, critical: u64) -> BridgeResult<()> {
        if critical > warning {
            return Err(BridgeError::ConfigInvalid {
                message: "critical threshold above warning threshold".to_string(),
            });
        }
        self.threshold_warning = warning;
        self.threshold_critical = critical;
        Ok(())
    }

    pub fn set_daily_limit(&mut self, limit: u64) {
        self.daily_limit = limit;
    }

    /// Quotes are refused while paused or below the critical threshold;
    /// settlements already past Pending keep running. Sitting exactly at
    /// the threshold still accepts.
    pub fn accepting_quotes(&self) -> bool {
        !self.paused && self.available() >= self.threshold_critical
    }
}
