use crate::builder::{BuildArtifact, BuildCache, BuildError};
use crate::classify::classify;
use crate::report::Finding;
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::search::{Probe, ProbeFault, SearchEngine, Trial};
use crate::variant::{BuildConfig, CorruptionPattern, ProbeParams, SeedVariant};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, mpsc};
use std::thread;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("build cache setup failed: {0}")]
    Cache(#[from] BuildError),
}

#[derive(Debug, Clone)]
pub struct MatrixSettings {
    /// Worker pool bound. Each worker owns one blocking child process at a
    /// time, so a hung candidate never stalls unrelated variants.
    pub workers: usize,
    /// Upper end of the magnitude axis searched per build.
    pub max_magnitude: u32,
    /// Probe budget per search.
    pub max_probes: u32,
    /// `buf_size` passed to candidates whose pattern takes an allocation
    /// size argument.
    pub default_alloc_size: u32,
}

impl Default for MatrixSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_magnitude: 4096,
            max_probes: 64,
            default_alloc_size: 64,
        }
    }
}

/// Probe backed by a real sandboxed execution: maps a magnitude to the
/// candidate's argument contract, runs it, classifies the outcome.
pub struct SandboxProbe<'a> {
    sandbox: &'a Sandbox,
    binary: PathBuf,
    pattern: CorruptionPattern,
    default_alloc: u32,
}

impl<'a> SandboxProbe<'a> {
    pub fn new(
        sandbox: &'a Sandbox,
        binary: PathBuf,
        pattern: CorruptionPattern,
        default_alloc: u32,
    ) -> Self {
        Self {
            sandbox,
            binary,
            pattern,
            default_alloc,
        }
    }
}

impl Probe for SandboxProbe<'_> {
    fn probe(&mut self, magnitude: u32) -> Result<Trial, ProbeFault> {
        let params = ProbeParams::for_pattern(self.pattern, self.default_alloc, magnitude);
        let outcome = self
            .sandbox
            .run(&self.binary, &params)
            .map_err(|e| ProbeFault::Launch(e.to_string()))?;
        let category = classify(&outcome);
        Ok(Trial::from_outcome(magnitude, &outcome, category))
    }
}

/// Enumerates the SeedVariant x BuildConfig cross-product, compiles through
/// the shared cache, and schedules one boundary search per cell on a bounded
/// worker pool.
pub struct Orchestrator {
    settings: MatrixSettings,
    sandbox_config: SandboxConfig,
}

impl Orchestrator {
    pub fn new(settings: MatrixSettings, sandbox_config: SandboxConfig) -> Self {
        Self {
            settings,
            sandbox_config,
        }
    }

    /// Runs the whole matrix. Every cell yields a finding: a failed compile
    /// becomes a `BuildFailed` finding, never an abort of the run.
    pub fn run(
        &self,
        variants: &[SeedVariant],
        configs: &[BuildConfig],
    ) -> Result<Vec<Finding>, MatrixError> {
        let cache = BuildCache::new()?;

        let mut jobs: VecDeque<(SeedVariant, BuildConfig)> = VecDeque::new();
        for variant in variants {
            for config in configs {
                // A config only applies to seeds of its own architecture.
                if config.arch == variant.arch {
                    jobs.push_back((variant.clone(), config.clone()));
                }
            }
        }

        let queue = Mutex::new(jobs);
        let (tx, rx) = mpsc::channel::<Finding>();
        let workers = self.settings.workers.max(1);

        let mut findings = thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let cache = &cache;
                scope.spawn(move || {
                    loop {
                        let job = queue.lock().ok().and_then(|mut q| q.pop_front());
                        let Some((variant, config)) = job else { break };
                        let finding = self.run_cell(cache, &variant, &config);
                        if tx.send(finding).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            rx.iter().collect::<Vec<Finding>>()
        });

        // Workers race on the channel; restore a stable order.
        findings.sort_by(|a, b| {
            (&a.variant_id, a.protection.label()).cmp(&(&b.variant_id, b.protection.label()))
        });
        Ok(findings)
    }

    fn run_cell(&self, cache: &BuildCache, variant: &SeedVariant, config: &BuildConfig) -> Finding {
        let build = match cache.get_or_build(variant, config) {
            Ok(build) => build,
            Err(e) => {
                eprintln!("build setup failed for {}: {e}", variant.id);
                return Finding::build_failed(variant, config.protection, e.to_string(), None);
            }
        };

        match &build.artifact {
            BuildArtifact::Failed { diagnostics } => Finding::build_failed(
                variant,
                config.protection,
                diagnostics.clone(),
                Some(build.key.clone()),
            ),
            BuildArtifact::Binary(path) => {
                let sandbox = Sandbox::new(self.sandbox_config.clone());
                let mut probe = SandboxProbe::new(
                    &sandbox,
                    path.clone(),
                    variant.pattern,
                    self.settings.default_alloc_size,
                );
                let engine = SearchEngine::new(self.settings.max_probes);
                let outcome = engine.find_boundaries(&mut probe, 0, self.settings.max_magnitude);
                Finding::from_search(variant, config.protection, Some(build.key.clone()), outcome)
            }
        }
    }
}
