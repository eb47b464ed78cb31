use crate::capture::{find_data_files, CaptureTarget, Collaborators};
use crate::error::ScanError;
use crate::handshake::finalize_handshakes;
use crate::netmap::{NetworkMap, PcapSummary};
use crate::runtime::async_spawn;
use crate::store::{SaveReport, Store};
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Starting,
    // Interface name or data directory
    Running(String),
    Finalizing,
}

#[derive(Debug, Clone)]
enum ScanJob {
    Live { interface: String },
    Files { dir: String },
}

impl ScanJob {
    fn starting_status(&self) -> String {
        match self {
            ScanJob::Live { interface } => format!("Live capture starting on {}...", interface),
            ScanJob::Files { dir } => format!("File scan starting in directory '{}'...", dir),
        }
    }

    fn running(&self) -> (ScanPhase, String) {
        match self {
            ScanJob::Live { interface } => (
                ScanPhase::Running(interface.clone()),
                format!("Live capture running on {}...", interface),
            ),
            ScanJob::Files { dir } => (
                ScanPhase::Running(dir.clone()),
                format!("Processing files in directory '{}'...", dir),
            ),
        }
    }
}

struct ScanState {
    phase: ScanPhase,
    status: String,
    cancel: Option<CancellationToken>,
}

impl ScanState {
    fn idle() -> Self {
        Self {
            phase: ScanPhase::Idle,
            status: "Idle".to_string(),
            cancel: None,
        }
    }
}

// Returns the manager to Idle on every exit path of a session, panics included
struct ResetGuard {
    state: Arc<Mutex<ScanState>>,
}

impl Drop for ResetGuard {
    fn drop(&mut self) {
        *self.state.lock() = ScanState::idle();
    }
}

/// Owns the "one scan at a time" state. The lock is only held for field
/// access, never across a pipeline stage.
#[derive(Clone)]
pub struct ScanManager {
    store: Store,
    collaborators: Collaborators,
    state: Arc<Mutex<ScanState>>,
}

impl ScanManager {
    pub fn new(store: Store, collaborators: Collaborators) -> Self {
        Self {
            store,
            collaborators,
            state: Arc::new(Mutex::new(ScanState::idle())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Resolves the campaign and launches a live capture session in the
    /// background. Returns the campaign id as soon as the session runs.
    pub async fn start_live(&self, campaign: &str, interface: &str) -> Result<i64, ScanError> {
        self.start(
            campaign,
            ScanJob::Live {
                interface: interface.to_string(),
            },
        )
        .await
    }

    pub async fn start_from_files(&self, campaign: &str, dir: &str) -> Result<i64, ScanError> {
        self.start(
            campaign,
            ScanJob::Files {
                dir: dir.to_string(),
            },
        )
        .await
    }

    async fn start(&self, campaign: &str, job: ScanJob) -> Result<i64, ScanError> {
        let (cancel, guard) = self.begin(&job)?;
        let campaign_id = self.resolve_campaign(campaign).await?;
        self.enter_running(&job);

        let manager = self.clone();
        let campaign = campaign.to_string();
        async_spawn(async move {
            let _guard = guard;
            info!("Starting background scan for campaign '{}'", campaign);
            match manager.run_pipeline(&campaign, campaign_id, job, cancel).await {
                Ok(report) => info!("Scan results saved for campaign '{}': {:?}", campaign, report),
                Err(e) => error!("Scan for campaign '{}' failed: {}", campaign, e),
            }
        })
        .map_err(|e| ScanError::TaskFailed(e.to_string()))?;
        Ok(campaign_id)
    }

    /// Signals cancellation to the running session, if any.
    pub fn stop(&self) {
        let state = self.state.lock();
        match &state.cancel {
            Some(cancel) => {
                info!("Stopping active scan");
                cancel.cancel();
            }
            None => info!("Stop requested but no scan is running"),
        }
    }

    pub fn status(&self) -> (bool, String) {
        let state = self.state.lock();
        (state.phase != ScanPhase::Idle, state.status.clone())
    }

    pub fn phase(&self) -> ScanPhase {
        self.state.lock().phase.clone()
    }

    /// Live capture until Ctrl-C or `stop()`, then finalization and save,
    /// all awaited by the caller.
    pub async fn run_live_blocking(
        &self,
        campaign: &str,
        interface: &str,
    ) -> anyhow::Result<SaveReport> {
        self.run_blocking(
            campaign,
            ScanJob::Live {
                interface: interface.to_string(),
            },
        )
        .await
        .with_context(|| format!("live scan on {} for campaign '{}'", interface, campaign))
    }

    pub async fn run_files_blocking(&self, campaign: &str, dir: &str) -> anyhow::Result<SaveReport> {
        self.run_blocking(
            campaign,
            ScanJob::Files {
                dir: dir.to_string(),
            },
        )
        .await
        .with_context(|| format!("file scan of '{}' for campaign '{}'", dir, campaign))
    }

    async fn run_blocking(&self, campaign: &str, job: ScanJob) -> Result<SaveReport, ScanError> {
        let (cancel, _guard) = self.begin(&job)?;
        let campaign_id = self.resolve_campaign(campaign).await?;
        info!("Operating on campaign '{}' ({})", campaign, campaign_id);
        self.enter_running(&job);

        let interrupt = {
            let cancel = cancel.clone();
            async_spawn(async move {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(_) => {
                            info!("Interrupt received, stopping scan");
                            cancel.cancel();
                        }
                        Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
                    },
                    _ = cancel.cancelled() => {}
                }
            })
            .map_err(|e| ScanError::TaskFailed(e.to_string()))?
        };

        let result = self.run_pipeline(campaign, campaign_id, job, cancel).await;
        interrupt.abort();
        result
    }

    fn begin(&self, job: &ScanJob) -> Result<(CancellationToken, ResetGuard), ScanError> {
        let mut state = self.state.lock();
        if state.phase != ScanPhase::Idle {
            return Err(ScanError::AlreadyScanning);
        }
        let cancel = CancellationToken::new();
        state.phase = ScanPhase::Starting;
        state.status = job.starting_status();
        state.cancel = Some(cancel.clone());
        Ok((
            cancel,
            ResetGuard {
                state: self.state.clone(),
            },
        ))
    }

    fn enter_running(&self, job: &ScanJob) {
        let (phase, status) = job.running();
        self.set_phase(phase, status);
    }

    fn set_phase(&self, phase: ScanPhase, status: String) {
        let mut state = self.state.lock();
        state.phase = phase;
        state.status = status;
    }

    async fn resolve_campaign(&self, campaign: &str) -> Result<i64, ScanError> {
        let store = self.store.clone();
        let name = campaign.to_string();
        tokio::task::spawn_blocking(move || store.get_or_create_campaign(&name))
            .await
            .map_err(|e| ScanError::TaskFailed(e.to_string()))?
            .map_err(|source| ScanError::Campaign {
                name: campaign.to_string(),
                source,
            })
    }

    // capture/parse, handshake finalization, enrichment, save. Strictly in that order.
    async fn run_pipeline(
        &self,
        campaign: &str,
        campaign_id: i64,
        job: ScanJob,
        cancel: CancellationToken,
    ) -> Result<SaveReport, ScanError> {
        let (mut map, mut summary) = match job {
            ScanJob::Live { interface } => {
                let mut map = NetworkMap::new();
                let mut summary = PcapSummary::new();
                self.collaborators
                    .capture
                    .capture(
                        cancel.clone(),
                        CaptureTarget::Interface(interface.clone()),
                        &mut map,
                        &mut summary,
                    )
                    .await?;
                info!("Live capture on {} finished for '{}'", interface, campaign);
                (map, summary)
            }
            ScanJob::Files { dir } => {
                let files = tokio::task::spawn_blocking(move || find_data_files(&dir))
                    .await
                    .map_err(|e| ScanError::TaskFailed(e.to_string()))??;
                if files.is_empty() {
                    info!("No new data files found for '{}'", campaign);
                    return Ok(SaveReport::default());
                }
                info!(
                    "Found {} nmap and {} capture file(s), processing",
                    files.xml.len(),
                    files.captures.len()
                );
                self.collaborators
                    .parser
                    .parse_files(cancel.clone(), files.xml, files.captures)
                    .await?
            }
        };
        if cancel.is_cancelled() {
            info!("Scan for '{}' was cancelled, keeping data captured so far", campaign);
        }

        self.set_phase(
            ScanPhase::Finalizing,
            format!("Finalizing data for '{}'...", campaign),
        );
        finalize_handshakes(&mut map, &mut summary);
        self.collaborators.enricher.enrich(&mut map, &summary).await?;

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_scan_results(campaign_id, &mut map, &summary))
            .await
            .map_err(|e| ScanError::TaskFailed(e.to_string()))?
            .map_err(|source| ScanError::Persistence {
                campaign_id,
                source,
            })
    }
}
