//! Test doubles and common utilities for engine contract tests
//!
//! Minimal collaborators that record what the engine asked of them,
//! without touching real DNS or a real filter tool.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dnat_core::config::RuleSource;
use dnat_core::ruleset::RulesetDocument;
use dnat_core::traits::{AddressResolver, ApplyOutcome, RuleApplier};

/// Local address the scripted resolver hands out unless a test says
/// otherwise
pub const LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

/// An AddressResolver whose answers are scripted by the test
pub struct ScriptedResolver {
    /// Domain -> address table, mutable while the engine runs
    domains: Arc<Mutex<HashMap<String, IpAddr>>>,
    /// Answer for local_address(); None simulates a host with no route
    local: Arc<Mutex<Option<IpAddr>>>,
    /// Call counter for resolve_domain()
    resolve_call_count: Arc<AtomicUsize>,
    /// Call counter for local_address()
    local_call_count: Arc<AtomicUsize>,
}

impl ScriptedResolver {
    /// Create a resolver that knows `entries` and answers local-address
    /// probes with [`LOCAL_IP`]
    pub fn new(entries: &[(&str, [u8; 4])]) -> Self {
        let domains = entries
            .iter()
            .map(|(domain, octets)| (domain.to_string(), IpAddr::V4(Ipv4Addr::from(*octets))))
            .collect();

        Self {
            domains: Arc::new(Mutex::new(domains)),
            local: Arc::new(Mutex::new(Some(LOCAL_IP))),
            resolve_call_count: Arc::new(AtomicUsize::new(0)),
            local_call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Point `domain` at a new address (simulates a dynamic-DNS change)
    pub fn set_domain(&self, domain: &str, octets: [u8; 4]) {
        self.domains
            .lock()
            .unwrap()
            .insert(domain.to_string(), IpAddr::V4(Ipv4Addr::from(octets)));
    }

    /// Make `domain` stop resolving
    pub fn forget_domain(&self, domain: &str) {
        self.domains.lock().unwrap().remove(domain);
    }

    /// Script the local-address answer
    pub fn set_local(&self, local: Option<IpAddr>) {
        *self.local.lock().unwrap() = local;
    }

    /// Get the number of times resolve_domain() was called
    pub fn resolve_call_count(&self) -> usize {
        self.resolve_call_count.load(Ordering::SeqCst)
    }

    /// Get the number of times local_address() was called
    pub fn local_call_count(&self) -> usize {
        self.local_call_count.load(Ordering::SeqCst)
    }

    /// Create a new ScriptedResolver that shares state with an existing
    /// one (the clone goes to the engine, the original stays with the
    /// test)
    pub fn sharing_state_with(other: &Self) -> Self {
        Self {
            domains: Arc::clone(&other.domains),
            local: Arc::clone(&other.local),
            resolve_call_count: Arc::clone(&other.resolve_call_count),
            local_call_count: Arc::clone(&other.local_call_count),
        }
    }
}

#[async_trait::async_trait]
impl AddressResolver for ScriptedResolver {
    async fn resolve_domain(&self, domain: &str) -> Option<IpAddr> {
        self.resolve_call_count.fetch_add(1, Ordering::SeqCst);
        self.domains.lock().unwrap().get(domain).copied()
    }

    async fn local_address(&self) -> Option<IpAddr> {
        self.local_call_count.fetch_add(1, Ordering::SeqCst);
        *self.local.lock().unwrap()
    }
}

/// A RuleApplier that records every document it is handed
pub struct RecordingApplier {
    /// Call counter for apply()
    apply_call_count: Arc<AtomicUsize>,
    /// Every document passed to apply(), in order
    applied: Arc<Mutex<Vec<RulesetDocument>>>,
    /// When set, apply() reports failure with this detail
    fail_with: Arc<Mutex<Option<String>>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self {
            apply_call_count: Arc::new(AtomicUsize::new(0)),
            applied: Arc::new(Mutex::new(Vec::new())),
            fail_with: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the number of times apply() was called
    pub fn apply_call_count(&self) -> usize {
        self.apply_call_count.load(Ordering::SeqCst)
    }

    /// Get the documents that were applied, in order
    pub fn applied_documents(&self) -> Vec<RulesetDocument> {
        self.applied.lock().unwrap().clone()
    }

    /// Make every following apply() report failure
    pub fn fail_applies(&self, detail: &str) {
        *self.fail_with.lock().unwrap() = Some(detail.to_string());
    }

    /// Make apply() succeed again
    pub fn succeed(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    /// Create a new RecordingApplier that shares counters with an
    /// existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            apply_call_count: Arc::clone(&other.apply_call_count),
            applied: Arc::clone(&other.applied),
            fail_with: Arc::clone(&other.fail_with),
        }
    }
}

#[async_trait::async_trait]
impl RuleApplier for RecordingApplier {
    async fn apply(&self, document: &RulesetDocument) -> ApplyOutcome {
        self.apply_call_count.fetch_add(1, Ordering::SeqCst);
        self.applied.lock().unwrap().push(document.clone());

        match self.fail_with.lock().unwrap().clone() {
            Some(detail) => ApplyOutcome::failed(detail),
            None => ApplyOutcome::Applied,
        }
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Write `content` into a fresh legacy rules file.
///
/// The TempDir guard must stay alive for the duration of the test or
/// the file disappears under the engine.
pub fn legacy_source(content: &str) -> (tempfile::TempDir, RuleSource) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rules.conf");
    std::fs::write(&path, content).expect("write rules file");
    (dir, RuleSource::Legacy(path))
}

/// Write `content` into a fresh TOML rules file
pub fn toml_source(content: &str) -> (tempfile::TempDir, RuleSource) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rules.toml");
    std::fs::write(&path, content).expect("write rules file");
    (dir, RuleSource::Toml(path))
}
