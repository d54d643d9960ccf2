// # Forward-policy guard
//
// Container runtimes (Docker 28 and later) set the iptables-nft
// filter/FORWARD chain policy to drop, which silently discards the very
// traffic the NAT rules forward. Before a load, this check dumps the
// active ruleset (`nft -j list ruleset`) and, where the ip or ip6
// FORWARD policy is drop, loads a small fix-up script flipping it back
// to accept.
//
// Everything here is best-effort: a missing tool, an unparseable dump
// or a rejected fix-up only warns, and the apply proceeds regardless.

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::run_bounded;

/// Dump the active ruleset and correct a dropped FORWARD policy.
pub(crate) async fn ensure_forward_policy(nft_binary: &Path, prepare_path: &Path) {
    let Some(dump) = dump_ruleset(nft_binary).await else {
        return;
    };

    let families = families_with_forward_drop(&dump);
    if families.is_empty() {
        debug!("filter FORWARD policy needs no correction");
        return;
    }

    info!("filter FORWARD policy is drop for {families:?}, loading fix-up");
    let script = fix_script(&families);
    if let Err(err) = tokio::fs::write(prepare_path, &script).await {
        warn!("cannot write {}: {err}", prepare_path.display());
        return;
    }

    let mut command = Command::new(nft_binary);
    command.arg("-f").arg(prepare_path);
    let label = format!("{} -f {}", nft_binary.display(), prepare_path.display());
    match run_bounded(command, &label).await {
        Ok(output) if output.status.success() => {
            info!("FORWARD policy set to accept for {families:?}");
        }
        Ok(output) => warn!("fix-up rejected: {label} exited with {}", output.status),
        Err(detail) => warn!("fix-up failed: {detail}"),
    }
}

async fn dump_ruleset(nft_binary: &Path) -> Option<RulesetDump> {
    let mut command = Command::new(nft_binary);
    command.arg("-j").arg("list").arg("ruleset");
    let label = format!("{} -j list ruleset", nft_binary.display());

    let output = match run_bounded(command, &label).await {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!("{label} exited with {}", output.status);
            return None;
        }
        Err(detail) => {
            warn!("{detail}");
            return None;
        }
    };

    match serde_json::from_slice(&output.stdout) {
        Ok(dump) => Some(dump),
        Err(err) => {
            warn!("cannot parse ruleset dump: {err}");
            None
        }
    }
}

/// Families whose filter/FORWARD chain currently drops.
///
/// Matches the uppercase chain name iptables-nft creates; a native
/// lowercase forward chain is the operator's own and is left alone.
fn families_with_forward_drop(dump: &RulesetDump) -> Vec<&str> {
    let mut families = Vec::new();

    for entry in &dump.nftables {
        let RulesetEntry::Chain {
            family,
            table,
            name,
            kind,
            hook,
            policy,
        } = entry
        else {
            continue;
        };

        let forward_drop = (family == "ip" || family == "ip6")
            && table == "filter"
            && name == "FORWARD"
            && kind.as_deref() == Some("filter")
            && hook.as_deref() == Some("forward")
            && policy.as_deref() == Some("drop");

        if forward_drop {
            families.push(family.as_str());
        }
    }

    families
}

fn fix_script(families: &[&str]) -> String {
    let mut script = String::from("#!/usr/sbin/nft -f\n\n");
    for family in families {
        script.push_str(&format!(
            "chain {family} filter FORWARD {{ policy accept ; }}\n"
        ));
    }
    script
}

/// Shape of `nft -j list ruleset` output
#[derive(Debug, Deserialize)]
struct RulesetDump {
    nftables: Vec<RulesetEntry>,
}

/// One dump entry. Only chains are inspected; the untagged catch-all
/// absorbs tables, rules, sets and whatever newer nft versions emit.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RulesetEntry {
    Chain {
        family: String,
        table: String,
        name: String,
        #[serde(rename = "type")]
        kind: Option<String>,
        hook: Option<String>,
        policy: Option<String>,
    },
    #[serde(untagged)]
    Other(serde_json::Value),
}
