//! Domain rules
//!
//! Operator-configured patterns that decide which resolved names belong to
//! which routing group.

pub mod domain;

pub use domain::{DomainRule, RuleKind};
