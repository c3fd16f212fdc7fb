//! Business rules checked before an entity is persisted.
//!
//! A rule wraps a [`Spec`] with the error to raise when a candidate does not
//! satisfy it. A [`RuleSet`] checks rules in order and stops at the first
//! violation.

use crate::error::DomainError;
use crate::specification::{Spec, Specification};
use crate::value::Attributes;

pub struct Rule<E: ?Sized> {
    spec: Spec<E>,
    message: String,
}

impl<E: ?Sized> Rule<E> {
    pub fn new(spec: Spec<E>, message: impl Into<String>) -> Self {
        Self {
            spec,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl<E: Attributes + ?Sized> Rule<E> {
    pub fn check(&self, candidate: &E) -> Option<DomainError> {
        if self.spec.is_satisfied_by(candidate) {
            None
        } else {
            Some(DomainError::validation(self.message.clone()))
        }
    }
}

impl<E: ?Sized> Clone for Rule<E> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            message: self.message.clone(),
        }
    }
}

pub struct RuleSet<E: ?Sized> {
    rules: Vec<Rule<E>>,
}

impl<E: ?Sized> Default for RuleSet<E> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<E: ?Sized> Clone for RuleSet<E> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
        }
    }
}

impl<E: ?Sized> RuleSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, spec: Spec<E>, message: impl Into<String>) -> Self {
        self.rules.push(Rule::new(spec, message));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<E: Attributes + ?Sized> RuleSet<E> {
    /// First violated rule, if any.
    pub fn check(&self, candidate: &E) -> Result<(), DomainError> {
        match self.rules.iter().find_map(|rule| rule.check(candidate)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    struct Price(i64);

    impl Attributes for Price {
        fn attribute(&self, field: &str) -> Option<Value> {
            (field == "price").then_some(Value::Int(self.0))
        }
    }

    #[test]
    fn first_violation_wins() {
        let rules = RuleSet::new()
            .with_rule(Spec::at_least("price", 0), "price must not be negative")
            .with_rule(Spec::at_most("price", 1_000), "price too high");

        assert!(rules.check(&Price(10)).is_ok());
        assert_eq!(
            rules.check(&Price(-1)).unwrap_err(),
            DomainError::validation("price must not be negative")
        );
        assert_eq!(
            rules.check(&Price(5_000)).unwrap_err(),
            DomainError::validation("price too high")
        );
    }
}
