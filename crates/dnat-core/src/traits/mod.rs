//! Core traits for the reconciliation loop
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`AddressResolver`]: Resolve tracked domains and the local outbound address
//! - [`RuleApplier`]: Load a rendered rule set into the packet filter

pub mod applier;
pub mod resolver;

pub use applier::{ApplyOutcome, RuleApplier};
pub use resolver::AddressResolver;
