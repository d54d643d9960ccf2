//! Core reconciliation engine
//!
//! The ReconcileEngine drives the loop that keeps the NAT rule set in
//! sync with the current addresses of the configured domains:
//!
//! ```text
//! ┌────────────┐  declarations  ┌─────────────────┐
//! │ RuleSource │ ─────────────▶ │ ReconcileEngine │──── EngineEvent ───▶
//! └────────────┘                └─────────────────┘
//!                                   │          │
//!                     resolve       │          │  changed rule sets
//!                ┌──────────────────┘          └──────────────────┐
//!                ▼                                                ▼
//!       ┌─────────────────┐                               ┌─────────────┐
//!       │ AddressResolver │                               │ RuleApplier │
//!       └─────────────────┘                               └─────────────┘
//! ```
//!
//! ## Cycle Flow
//!
//! 1. Re-read the rule source (config edits need no restart)
//! 2. Probe the local outbound address; no address fails the cycle
//!    before anything is rendered
//! 3. Resolve each declaration's domain and compile the document
//! 4. Byte-compare against the baseline; unchanged means nothing to do
//! 5. Apply the changed document; applied or not, the render becomes
//!    the next baseline
//! 6. Emit an event, sleep the fixed interval, repeat

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RuleSource;
use crate::error::{Error, Result};
use crate::ruleset::{self, RulesetDocument};
use crate::traits::{AddressResolver, ApplyOutcome, RuleApplier};

/// Pause between reconciliation cycles. Not configurable at runtime.
pub const CYCLE_INTERVAL: Duration = Duration::from_secs(120);

/// Capacity of the engine event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the ReconcileEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started reconciling
    Started {
        source: String,
    },

    /// A changed rule set was rendered and loaded successfully
    Applied {
        ruleset: RulesetDocument,
    },

    /// A changed rule set was rendered but the filter tool rejected it.
    /// The render still becomes the new baseline.
    ApplyFailed {
        detail: String,
    },

    /// The rendered rule set matched the baseline; nothing was applied
    Unchanged,

    /// The cycle failed before rendering (for example no local address);
    /// the baseline is untouched and the loop continues
    CycleFailed {
        error: String,
    },

    /// Engine stopped
    Stopped {
        reason: String,
    },
}

/// Core reconciliation engine
///
/// The engine owns the read → resolve → compile → compare → apply cycle
/// and runs it forever on a fixed period.
///
/// ## Lifecycle
///
/// 1. Create with [`ReconcileEngine::new()`]
/// 2. Start with [`ReconcileEngine::run()`]
/// 3. Engine runs until a shutdown signal is received or a fatal
///    configuration error surfaces
///
/// ## Baseline
///
/// The only state carried across cycles is the baseline: the most
/// recently rendered document, threaded through [`run_cycle`] as an
/// explicit value. It advances after every render, including renders the
/// filter tool rejected, so a persistently failing apply is attempted
/// once per content change rather than once per cycle.
///
/// [`run_cycle`]: ReconcileEngine::run_cycle
pub struct ReconcileEngine {
    /// Where declarations come from, re-read every cycle
    source: RuleSource,

    /// Domain and local-address resolution
    resolver: Box<dyn AddressResolver>,

    /// Persists and loads changed rule sets
    applier: Box<dyn RuleApplier>,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<EngineEvent>,
}

impl ReconcileEngine {
    /// Create a new engine.
    ///
    /// # Parameters
    ///
    /// - `source`: rule declaration source (validated lazily, on each read)
    /// - `resolver`: address resolver implementation
    /// - `applier`: rule applier implementation
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields
    /// one event per cycle outcome.
    pub fn new(
        source: RuleSource,
        resolver: Box<dyn AddressResolver>,
        applier: Box<dyn RuleApplier>,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Self {
            source,
            resolver,
            applier,
            event_tx: tx,
        };

        (engine, rx)
    }

    /// Run the engine until a shutdown signal arrives.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: clean shutdown
    /// - `Err(Error)`: fatal error (missing or corrupt configuration)
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run with a scoped shutdown signal.
    ///
    /// `Some(rx)` stops the loop when the oneshot fires (or its sender is
    /// dropped); `None` falls back to the OS signal handling [`run`] uses.
    /// Tests drive shutdown through this; production code calls [`run`].
    ///
    /// [`run`]: ReconcileEngine::run
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        match shutdown_rx {
            Some(rx) => {
                self.drive(async {
                    // A dropped sender counts as shutdown too.
                    let _ = rx.await;
                })
                .await
            }
            None => self.drive(wait_for_os_signal()).await,
        }
    }

    async fn drive(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        info!(
            "reconciling {} every {}s",
            self.source,
            CYCLE_INTERVAL.as_secs()
        );
        self.emit_event(EngineEvent::Started {
            source: self.source.to_string(),
        });

        let mut baseline = RulesetDocument::empty();

        loop {
            match self.run_cycle(&baseline).await {
                Ok(next) => baseline = next,
                Err(err) if err.is_fatal() => {
                    error!("fatal: {err}");
                    self.emit_event(EngineEvent::Stopped {
                        reason: err.to_string(),
                    });
                    return Err(err);
                }
                Err(err) => {
                    warn!("cycle failed, retrying next period: {err}");
                    self.emit_event(EngineEvent::CycleFailed {
                        error: err.to_string(),
                    });
                }
            }

            // Shutdown is only observed here: an in-flight cycle always
            // finishes, including the apply step and its timeout.
            tokio::select! {
                _ = tokio::time::sleep(CYCLE_INTERVAL) => {}
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    self.emit_event(EngineEvent::Stopped {
                        reason: "shutdown signal".to_string(),
                    });
                    return Ok(());
                }
            }
        }
    }

    /// Execute one reconciliation cycle against `baseline` and return the
    /// next baseline.
    ///
    /// The rendered document becomes the next baseline even when the
    /// filter tool rejects it, so unchanged-but-rejected content is
    /// applied once, not hammered every period. Errors returned here are
    /// cycle-scoped unless [`Error::is_fatal`] says otherwise.
    ///
    /// Public so tests can drive cycles deterministically; production
    /// code uses [`ReconcileEngine::run`].
    pub async fn run_cycle(&self, baseline: &RulesetDocument) -> Result<RulesetDocument> {
        let declarations = self.source.load().await?;
        debug!("loaded {} declarations from {}", declarations.len(), self.source);

        let local_ip = self
            .resolver
            .local_address()
            .await
            .ok_or_else(|| Error::local_address_unavailable("local outbound probe failed"))?;

        let document = ruleset::compile(&declarations, local_ip, self.resolver.as_ref()).await?;

        if !ruleset::has_changed(&document, baseline) {
            debug!("rule set unchanged, not applying");
            self.emit_event(EngineEvent::Unchanged);
            return Ok(document);
        }

        info!("rule set changed:\n{document}");
        match self.applier.apply(&document).await {
            ApplyOutcome::Applied => {
                info!("rule set loaded via {}", self.applier.name());
                self.emit_event(EngineEvent::Applied {
                    ruleset: document.clone(),
                });
            }
            ApplyOutcome::Failed { detail } => {
                warn!("apply failed, baseline advances anyway: {detail}");
                self.emit_event(EngineEvent::ApplyFailed { detail });
            }
        }

        Ok(document)
    }

    fn emit_event(&self, event: EngineEvent) {
        // Monitoring is best-effort: a full channel drops the event
        // rather than stalling the cycle.
        if self.event_tx.try_send(event).is_err() {
            warn!("event channel full, dropping event");
        }
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = ctrl_c_or_pending() => {}
            }
        }
        Err(err) => {
            error!("cannot install SIGTERM handler: {err}");
            ctrl_c_or_pending().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
    ctrl_c_or_pending().await;
}

async fn ctrl_c_or_pending() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        // With no working signal handler the loop must keep running;
        // the process can still be stopped by SIGKILL.
        error!("cannot listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
