use serde::{Deserialize, Serialize};

use keystone_core::{DomainError, DomainResult, ValueObject};

/// Non-negative amount in the smallest currency unit (e.g. cents).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub fn from_cents(cents: i64) -> DomainResult<Self> {
        if cents < 0 {
            return Err(DomainError::validation("amount must not be negative"));
        }
        Ok(Self(cents))
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn times(self, quantity: i64) -> DomainResult<Self> {
        self.0
            .checked_mul(quantity)
            .ok_or_else(|| DomainError::validation("amount overflow"))
            .and_then(Self::from_cents)
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Self> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or_else(|| DomainError::validation("amount overflow"))
    }
}

impl ValueObject for Money {}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}
