//! Architectural Contract Test: First Apply
//!
//! On a fresh start the baseline is empty, so the first rendered
//! document always counts as changed and must reach the applier exactly
//! as rendered.
//!
//! Constraints verified:
//! - The first cycle applies even when the config produces no rules
//! - The applied document is byte-for-byte the rendered document
//! - The Applied event carries the same document the applier saw
//! - run_cycle returns the rendered document as the next baseline
//!
//! If this test fails, someone has added:
//! - A "skip apply on startup" shortcut
//! - Post-render mutation of the document between compare and apply

mod common;

use common::*;
use dnat_core::engine::{EngineEvent, ReconcileEngine};
use dnat_core::ruleset::{PREAMBLE, RulesetDocument};

#[tokio::test]
async fn first_cycle_applies_the_rendered_document() {
    let resolver = ScriptedResolver::new(&[("example.com", [203, 0, 113, 5])]);
    let applier = RecordingApplier::new();
    let (_dir, source) = legacy_source("SINGLE,8080,80,example.com,tcp\n");

    let (engine, mut events) = ReconcileEngine::new(
        source,
        Box::new(ScriptedResolver::sharing_state_with(&resolver)),
        Box::new(RecordingApplier::sharing_counters_with(&applier)),
    );

    let next = engine
        .run_cycle(&RulesetDocument::empty())
        .await
        .expect("cycle should succeed");

    let expected = format!(
        "{PREAMBLE}# SINGLE,8080,80,example.com,tcp\n\
         add rule ip nat PREROUTING tcp dport 8080 counter dnat to 203.0.113.5:80\n\
         add rule ip nat POSTROUTING ip daddr 203.0.113.5 tcp dport 80 counter snat to 10.0.0.2\n"
    );
    assert_eq!(next.as_str(), expected);

    assert_eq!(applier.apply_call_count(), 1);
    assert_eq!(applier.applied_documents()[0], next);

    let event = events.try_recv().expect("one event should be queued");
    assert_eq!(event, EngineEvent::Applied { ruleset: next });
}

#[tokio::test]
async fn empty_config_still_applies_the_preamble() {
    let resolver = ScriptedResolver::new(&[]);
    let applier = RecordingApplier::new();
    let (_dir, source) = legacy_source("");

    let (engine, _events) = ReconcileEngine::new(
        source,
        Box::new(ScriptedResolver::sharing_state_with(&resolver)),
        Box::new(RecordingApplier::sharing_counters_with(&applier)),
    );

    let next = engine
        .run_cycle(&RulesetDocument::empty())
        .await
        .expect("cycle should succeed");

    // Flushing the table is itself a change worth loading.
    assert_eq!(next.as_str(), PREAMBLE);
    assert_eq!(applier.apply_call_count(), 1);
}

#[tokio::test]
async fn missing_protocol_field_renders_both_protocols_tcp_first() {
    let resolver = ScriptedResolver::new(&[("example.com", [203, 0, 113, 5])]);
    let applier = RecordingApplier::new();
    let (_dir, source) = legacy_source("SINGLE,8080,80,example.com\n");

    let (engine, _events) = ReconcileEngine::new(
        source,
        Box::new(ScriptedResolver::sharing_state_with(&resolver)),
        Box::new(RecordingApplier::sharing_counters_with(&applier)),
    );

    let next = engine
        .run_cycle(&RulesetDocument::empty())
        .await
        .expect("cycle should succeed");

    let text = next.as_str();
    let tcp = text
        .find("PREROUTING tcp dport 8080")
        .expect("tcp rule should render");
    let udp = text
        .find("PREROUTING udp dport 8080")
        .expect("udp rule should render");
    assert!(tcp < udp, "tcp pair must precede the udp pair");
}
