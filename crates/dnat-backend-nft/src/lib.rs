// # nftables Rule Applier
//
// This crate provides the production RuleApplier for the dnat system.
//
// ## How It Works
//
// A changed rule-set document is persisted to a well-known file and
// loaded with `nft -f <file>`. The invocation is bounded: the tool gets
// one second, a timed-out child is killed, and any failure is reported
// as an outcome value so the reconciliation loop keeps running.
//
// Before each load the forward-policy guard (ruleset_check) inspects the
// active ruleset and flips a `drop` filter/FORWARD policy back to
// `accept`, since container runtimes set it behind the operator's back.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use dnat_core::ruleset::RulesetDocument;
use dnat_core::traits::{ApplyOutcome, RuleApplier};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

mod ruleset_check;

/// Default filter tool binary
const NFT_BINARY: &str = "/usr/sbin/nft";

/// Rule-set file, rewritten on every applied change
const RULESET_FILE: &str = "nat-diy.nft";

/// Fix-up script written next to the rule-set file when the forward
/// policy needs correcting
const PREPARE_FILE: &str = "nat-prepare.nft";

/// Wait bound for every filter-tool invocation. Rule loading is local
/// and fast; anything slower is treated as a hang.
pub(crate) const TOOL_TIMEOUT: Duration = Duration::from_secs(1);

/// RuleApplier that shells out to nftables
pub struct NftApplier {
    /// Filter tool binary
    nft_binary: PathBuf,

    /// Where the rendered document is persisted before loading
    ruleset_path: PathBuf,
}

impl NftApplier {
    /// Create an applier with the standard binary and a rule-set file in
    /// the working directory
    pub fn new() -> Self {
        Self {
            nft_binary: NFT_BINARY.into(),
            ruleset_path: RULESET_FILE.into(),
        }
    }

    /// Create an applier with explicit paths (tests point the binary at
    /// a stand-in and the rule file into a scratch directory)
    pub fn with_paths(nft_binary: impl Into<PathBuf>, ruleset_path: impl Into<PathBuf>) -> Self {
        Self {
            nft_binary: nft_binary.into(),
            ruleset_path: ruleset_path.into(),
        }
    }

    /// The rule-set file this applier writes
    pub fn ruleset_path(&self) -> &Path {
        &self.ruleset_path
    }

    fn prepare_path(&self) -> PathBuf {
        self.ruleset_path.with_file_name(PREPARE_FILE)
    }

    async fn persist(&self, document: &RulesetDocument) -> std::io::Result<()> {
        let mut file = File::create(&self.ruleset_path).await?;
        file.write_all(document.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

impl Default for NftApplier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleApplier for NftApplier {
    async fn apply(&self, document: &RulesetDocument) -> ApplyOutcome {
        // Guard first: loading NAT rules while filter/FORWARD drops
        // everything would look applied yet forward nothing.
        ruleset_check::ensure_forward_policy(&self.nft_binary, &self.prepare_path()).await;

        if let Err(err) = self.persist(document).await {
            return ApplyOutcome::failed(format!(
                "cannot write {}: {err}",
                self.ruleset_path.display()
            ));
        }
        debug!(
            "wrote {} bytes to {}",
            document.as_bytes().len(),
            self.ruleset_path.display()
        );

        let mut command = Command::new(&self.nft_binary);
        command.arg("-f").arg(&self.ruleset_path);
        let label = format!(
            "{} -f {}",
            self.nft_binary.display(),
            self.ruleset_path.display()
        );
        info!("running {label}");

        match run_bounded(command, &label).await {
            Ok(output) if output.status.success() => ApplyOutcome::Applied,
            Ok(output) => ApplyOutcome::failed(describe_failure(&label, &output)),
            Err(detail) => ApplyOutcome::failed(detail),
        }
    }

    fn name(&self) -> &'static str {
        "nft"
    }
}

/// Run a filter-tool invocation with output captured and the fixed wait
/// bound applied. A timed-out child is killed (kill_on_drop).
pub(crate) async fn run_bounded(mut command: Command, label: &str) -> Result<Output, String> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|err| format!("cannot spawn {label}: {err}"))?;

    match tokio::time::timeout(TOOL_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(format!("{label} produced no output: {err}")),
        Err(_) => Err(format!(
            "{label} timed out after {}s and was killed",
            TOOL_TIMEOUT.as_secs()
        )),
    }
}

fn describe_failure(label: &str, output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!(
        "{label} exited with {} (stdout: {}; stderr: {})",
        output.status,
        stdout.trim(),
        stderr.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnat_core::ruleset::{PREAMBLE, RulesetDocument, compile};
    use dnat_core::traits::AddressResolver;
    use std::net::{IpAddr, Ipv4Addr};

    struct NoopResolver;

    #[async_trait]
    impl AddressResolver for NoopResolver {
        async fn resolve_domain(&self, _domain: &str) -> Option<IpAddr> {
            None
        }

        async fn local_address(&self) -> Option<IpAddr> {
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
        }
    }

    async fn preamble_document() -> RulesetDocument {
        compile(&[], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), &NoopResolver)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_reports_success_on_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let applier = NftApplier::with_paths("/bin/true", dir.path().join(RULESET_FILE));

        let outcome = applier.apply(&preamble_document().await).await;
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_apply_persists_the_document_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RULESET_FILE);
        let applier = NftApplier::with_paths("/bin/true", &path);

        applier.apply(&preamble_document().await).await;

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, PREAMBLE);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_failure_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let applier = NftApplier::with_paths("/bin/false", dir.path().join(RULESET_FILE));

        let outcome = applier.apply(&preamble_document().await).await;
        match outcome {
            ApplyOutcome::Failed { detail } => {
                assert!(detail.contains("exited with"), "got: {detail}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_failure_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let applier = NftApplier::with_paths(
            dir.path().join("no-such-nft"),
            dir.path().join(RULESET_FILE),
        );

        let outcome = applier.apply(&preamble_document().await).await;
        match outcome {
            ApplyOutcome::Failed { detail } => {
                assert!(detail.contains("cannot spawn"), "got: {detail}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hanging_tool_is_killed_and_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-nft");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let applier = NftApplier::with_paths(&script, dir.path().join(RULESET_FILE));

        let outcome = applier.apply(&preamble_document().await).await;
        match outcome {
            ApplyOutcome::Failed { detail } => {
                assert!(detail.contains("timed out"), "got: {detail}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_prepare_file_lands_next_to_the_ruleset() {
        let applier = NftApplier::with_paths("/usr/sbin/nft", "/var/lib/dnat/nat-diy.nft");
        assert_eq!(
            applier.prepare_path(),
            PathBuf::from("/var/lib/dnat/nat-prepare.nft")
        );
    }
}
