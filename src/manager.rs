//! Orders phases and drives their lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info};

use crate::cluster::Cluster;
use crate::phases::connect::Connect;
use crate::phases::detect_os::DetectOs;
use crate::phases::disconnect::Disconnect;
use crate::phases::download_binaries::DownloadBinaries;
use crate::phases::gather_facts::GatherFacts;
use crate::phases::upgrade_controllers::UpgradeControllers;
use crate::phases::upgrade_workers::UpgradeWorkers;
use crate::phases::{Phase, PhaseContext};

/// What happened to one phase during a run.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub title: &'static str,
    pub skipped: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Runs phases in order. The first failure stops the run; the failing
/// phase still gets its clean_up, phases after it are never prepared.
pub struct PhaseManager {
    cluster: Arc<Cluster>,
    ctx: Arc<PhaseContext>,
    phases: Vec<Box<dyn Phase>>,
    outcomes: Vec<PhaseOutcome>,
}

impl PhaseManager {
    pub fn new(cluster: Arc<Cluster>, ctx: Arc<PhaseContext>) -> Self {
        Self {
            cluster,
            ctx,
            phases: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Manager loaded with the standard upgrade pipeline.
    pub fn with_default_phases(cluster: Arc<Cluster>, ctx: Arc<PhaseContext>) -> Self {
        let mut manager = Self::new(cluster, ctx);
        manager.add(Connect::default());
        manager.add(DetectOs::default());
        manager.add(GatherFacts::default());
        manager.add(DownloadBinaries::default());
        manager.add(UpgradeControllers::default());
        manager.add(UpgradeWorkers::default());
        manager.add(Disconnect::default());
        manager
    }

    pub fn add<P: Phase + 'static>(&mut self, phase: P) {
        self.phases.push(Box::new(phase));
    }

    pub fn context(&self) -> &Arc<PhaseContext> {
        &self.ctx
    }

    /// Outcomes recorded so far, in execution order.
    pub fn outcomes(&self) -> &[PhaseOutcome] {
        &self.outcomes
    }

    pub async fn run(&mut self) -> Result<()> {
        let run_started = Instant::now();
        for i in 0..self.phases.len() {
            let title = self.phases[i].title();
            let started = Instant::now();

            if let Err(err) = self.phases[i].prepare(&self.cluster, &self.ctx).await {
                self.outcomes.push(PhaseOutcome {
                    title,
                    skipped: false,
                    duration: started.elapsed(),
                    error: Some(format!("{err:#}")),
                });
                return Err(err.context(format!("phase `{title}` failed to prepare")));
            }

            if !self.phases[i].should_run() {
                info!("skipping phase: {title}");
                self.outcomes.push(PhaseOutcome {
                    title,
                    skipped: true,
                    duration: started.elapsed(),
                    error: None,
                });
                continue;
            }

            info!("==> running phase: {title}");
            let result = self.phases[i].run().await;
            self.phases[i].clean_up().await;

            match result {
                Ok(()) => {
                    self.outcomes.push(PhaseOutcome {
                        title,
                        skipped: false,
                        duration: started.elapsed(),
                        error: None,
                    });
                }
                Err(err) => {
                    error!("phase `{title}` failed: {err:#}");
                    self.outcomes.push(PhaseOutcome {
                        title,
                        skipped: false,
                        duration: started.elapsed(),
                        error: Some(format!("{err:#}")),
                    });
                    return Err(err.context(format!("phase `{title}` failed")));
                }
            }
        }

        let completed = self.outcomes.iter().filter(|o| !o.skipped).count();
        info!(
            "completed {completed} phase(s) in {:.1?}",
            run_started.elapsed()
        );
        Ok(())
    }
}
