// # dnat-core
//
// Core library for the NAT rule-set reconciliation loop.
//
// ## Architecture Overview
//
// This library provides everything the daemon needs short of the real
// resolver and filter-tool backends:
// - **AddressResolver**: Trait for domain and local-address resolution
// - **RuleApplier**: Trait for persisting and loading a rendered rule set
// - **RuleSource**: Declaration parsing (legacy lines or TOML)
// - **ruleset**: Compiler from declarations to the nftables document
// - **ReconcileEngine**: The fixed-period reconciliation loop
//
// ## Design Principles
//
// 1. **Separation of Concerns**: resolution and rule loading live behind
//    traits; the engine owns only sequencing and the baseline
// 2. **Recompute, Don't Cache**: every cycle re-reads the config and
//    re-resolves every domain from scratch
// 3. **Documents Are Opaque**: change detection is byte equality, never
//    semantic diffing
// 4. **Library-First**: the daemon binary is a thin wiring layer

pub mod traits;
pub mod engine;
pub mod config;
pub mod error;
pub mod ruleset;

// Re-export core types for convenience
pub use traits::{AddressResolver, ApplyOutcome, RuleApplier};
pub use engine::{CYCLE_INTERVAL, EngineEvent, ReconcileEngine};
pub use config::{Declaration, RuleSource};
pub use error::{Error, Result};
pub use ruleset::{RulesetDocument, compile, has_changed};
