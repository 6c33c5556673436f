//! Token usage accounting against a token budget.

use std::fmt;

/// Severity band for how much of the context budget is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenStatus {
    /// Up to a third of the budget.
    Green,
    /// Up to 60 %.
    Yellow,
    /// Below 95 %.
    Red,
    /// 95 % or more. The next request will likely overflow.
    Critical,
}

impl TokenStatus {
    /// Band for a whole-number usage percentage.
    #[must_use]
    pub fn for_percent(percent: usize) -> Self {
        if percent >= 95 {
            Self::Critical
        } else if percent > 60 {
            Self::Red
        } else if percent > 33 {
            Self::Yellow
        } else {
            Self::Green
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Snapshot of tokens used since the last session reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenUsage {
    pub used: usize,
    pub budget: usize,
    pub percent: f32,
    pub status: TokenStatus,
}

impl TokenUsage {
    /// Usage of `used` tokens out of `budget`. A zero budget counts as full.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(used: usize, budget: usize) -> Self {
        let (whole, percent) = if budget == 0 {
            (100, 100.0)
        } else {
            (
                used.saturating_mul(100) / budget,
                used as f32 / budget as f32 * 100.0,
            )
        };
        Self {
            used,
            budget,
            percent,
            status: TokenStatus::for_percent(whole),
        }
    }

    /// Tokens left before the budget is reached.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }
}

impl fmt::Display for TokenUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} tokens ({:.1}%, {})",
            self.used, self.budget, self.percent, self.status
        )
    }
}
