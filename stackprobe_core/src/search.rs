use crate::classify::{Category, SEV_BYPASSED, SEV_DETECTED, SEV_SAFE};
use crate::sandbox::RawOutcome;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure to obtain any outcome at all for a probe (as opposed to an
/// outcome that merely classifies as noise).
#[derive(Error, Debug)]
pub enum ProbeFault {
    #[error("candidate launch failed: {0}")]
    Launch(String),
}

/// One sealed execution record. Never mutated after the search engine
/// appends it to the history.
#[derive(Serialize, Debug, Clone)]
pub struct Trial {
    pub magnitude: u32,
    pub category: Category,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub wall_time_ms: u64,
    /// Probe invocations spent on this magnitude, counting retries.
    pub attempts: u32,
}

impl Trial {
    pub fn from_outcome(magnitude: u32, outcome: &RawOutcome, category: Category) -> Self {
        Trial {
            magnitude,
            category,
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            timed_out: outcome.timed_out,
            wall_time_ms: outcome.elapsed.as_millis() as u64,
            attempts: 1,
        }
    }

    /// Trial with no process behind it. Used by deterministic fake probes.
    pub fn synthetic(magnitude: u32, category: Category) -> Self {
        Trial {
            magnitude,
            category,
            exit_code: None,
            signal: None,
            timed_out: false,
            wall_time_ms: 0,
            attempts: 1,
        }
    }
}

/// The oracle function binary search consults: one candidate execution at
/// one corruption magnitude.
///
/// Injected as a capability so the engine is testable against deterministic
/// fakes, independent of real process execution.
pub trait Probe {
    fn probe(&mut self, magnitude: u32) -> Result<Trial, ProbeFault>;
}

/// Why a boundary could not be pinned to a magnitude.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UndeterminedReason {
    /// The category was never observed anywhere in the searched range.
    NeverObserved,
    /// A probe stayed in a noise category (timeout, app error, odd signal)
    /// even after the retry.
    Unstable,
    /// The candidate could not be launched, twice.
    LaunchFailed,
    /// The probe budget ran out before convergence.
    Exhausted,
    /// No search ran at all (the build produced no binary).
    NotSearched,
    /// A monotonicity violation poisoned the search; see the anomaly record.
    Anomaly,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Boundary {
    At(u32),
    Undetermined(UndeterminedReason),
}

/// Severity regressed as magnitude grew. Binary search's correctness rests
/// on monotonicity, so the conflicting trials are surfaced verbatim instead
/// of being resolved by guesswork.
#[derive(Serialize, Debug, Clone)]
pub struct Anomaly {
    pub lower: Trial,
    pub upper: Trial,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    /// No fault anywhere in the range; the magnitude ceiling never reached
    /// past the frame.
    NoFault,
    /// The canary engaged and no fault escaped it.
    Protected,
    /// The canary engaged, but a larger magnitude still faulted past it.
    DetectedThenBypassed,
    /// A fault with no canary engagement at any smaller magnitude. The
    /// finding class this oracle exists to surface.
    SilentBypass,
    Undetermined,
    BuildFailed,
}

impl Verdict {
    fn from_boundaries(detection: Boundary, bypass: Boundary) -> Self {
        use Boundary::{At, Undetermined};
        use UndeterminedReason::NeverObserved;
        match (detection, bypass) {
            (Undetermined(NeverObserved), Undetermined(NeverObserved)) => Verdict::NoFault,
            (At(_), Undetermined(NeverObserved)) => Verdict::Protected,
            (At(_), At(_)) => Verdict::DetectedThenBypassed,
            (Undetermined(NeverObserved), At(_)) => Verdict::SilentBypass,
            _ => Verdict::Undetermined,
        }
    }
}

/// Terminal result of one boundary search over a build.
#[derive(Serialize, Debug, Clone)]
pub struct SearchOutcome {
    /// Smallest magnitude at which the canary check fired.
    pub detection: Boundary,
    /// Smallest magnitude at which a fault occurred.
    pub bypass: Boundary,
    pub verdict: Verdict,
    pub anomaly: Option<Anomaly>,
    pub trials: Vec<Trial>,
    pub probes_issued: u32,
}

/// Locates the detection and bypass boundaries of one build via monotone
/// binary search over the corruption-magnitude axis.
pub struct SearchEngine {
    max_probes: u32,
}

enum Halt {
    DeadEnd(UndeterminedReason),
    Anomaly,
}

impl SearchEngine {
    pub fn new(max_probes: u32) -> Self {
        Self { max_probes }
    }

    /// Runs both boundary searches within `[lo, hi]`.
    ///
    /// Probes are issued strictly sequentially: each magnitude depends on
    /// the previous outcome. Results are cached per magnitude, so the second
    /// search rides on trials the first already paid for.
    pub fn find_boundaries(&self, probe: &mut dyn Probe, lo: u32, hi: u32) -> SearchOutcome {
        let mut ctx = SearchCtx {
            probe,
            cache: BTreeMap::new(),
            trials: Vec::new(),
            issued: 0,
            max_probes: self.max_probes,
            anomaly: None,
        };

        let first_fault = ctx.lowest_at_or_above(SEV_DETECTED, lo, hi);

        let mut detection = match &first_fault {
            Ok(Some(m)) if ctx.cache.get(m) == Some(&Category::CanaryDetected) => Boundary::At(*m),
            Ok(_) => Boundary::Undetermined(UndeterminedReason::NeverObserved),
            Err(halt) => Boundary::Undetermined(halt_reason(halt)),
        };

        // A dead-end in the first search does not forfeit the second; only a
        // monotonicity violation poisons everything.
        let mut bypass = if ctx.anomaly.is_some() {
            Boundary::Undetermined(UndeterminedReason::Anomaly)
        } else {
            match ctx.lowest_at_or_above(SEV_BYPASSED, lo, hi) {
                Ok(Some(m)) => Boundary::At(m),
                Ok(None) => Boundary::Undetermined(UndeterminedReason::NeverObserved),
                Err(halt) => Boundary::Undetermined(halt_reason(&halt)),
            }
        };

        if ctx.anomaly.is_some() {
            detection = Boundary::Undetermined(UndeterminedReason::Anomaly);
            bypass = Boundary::Undetermined(UndeterminedReason::Anomaly);
        }

        SearchOutcome {
            detection,
            bypass,
            verdict: Verdict::from_boundaries(detection, bypass),
            anomaly: ctx.anomaly,
            trials: ctx.trials,
            probes_issued: ctx.issued,
        }
    }
}

fn halt_reason(halt: &Halt) -> UndeterminedReason {
    match halt {
        Halt::DeadEnd(reason) => *reason,
        Halt::Anomaly => UndeterminedReason::Anomaly,
    }
}

struct SearchCtx<'a> {
    probe: &'a mut dyn Probe,
    /// Classified category per magnitude; only severity-bearing categories
    /// land here.
    cache: BTreeMap<u32, Category>,
    trials: Vec<Trial>,
    issued: u32,
    max_probes: u32,
    anomaly: Option<Anomaly>,
}

impl SearchCtx<'_> {
    /// Smallest magnitude in `[lo, hi]` whose severity is at least
    /// `threshold`, or `None` if `hi` stays below it.
    ///
    /// Invariant while narrowing: `below` is known under the threshold, `at`
    /// is known at-or-above it.
    fn lowest_at_or_above(
        &mut self,
        threshold: u8,
        lo: u32,
        hi: u32,
    ) -> Result<Option<u32>, Halt> {
        if self.severity_at(lo)? >= threshold {
            return Ok(Some(lo));
        }
        if lo == hi || self.severity_at(hi)? < threshold {
            return Ok(None);
        }
        let (mut below, mut at) = (lo, hi);
        while at - below > 1 {
            let mid = below + (at - below) / 2;
            if self.severity_at(mid)? >= threshold {
                at = mid;
            } else {
                below = mid;
            }
        }
        Ok(Some(at))
    }

    fn severity_at(&mut self, magnitude: u32) -> Result<u8, Halt> {
        Ok(self.observe(magnitude)?.severity().unwrap_or(SEV_SAFE))
    }

    /// One probe at `magnitude`, with the retry policy applied: a launch
    /// fault or a noise category is retried once at the same magnitude, then
    /// treated as a dead-end for the boundary being searched.
    fn observe(&mut self, magnitude: u32) -> Result<Category, Halt> {
        if let Some(&cached) = self.cache.get(&magnitude) {
            return Ok(cached);
        }
        if self.issued >= self.max_probes {
            return Err(Halt::DeadEnd(UndeterminedReason::Exhausted));
        }
        self.issued += 1;

        let mut attempts = 1u32;
        let mut trial = match self.probe.probe(magnitude) {
            Ok(trial) => trial,
            Err(_) => {
                attempts += 1;
                self.probe
                    .probe(magnitude)
                    .map_err(|_| Halt::DeadEnd(UndeterminedReason::LaunchFailed))?
            }
        };
        if trial.category.severity().is_none() {
            attempts += 1;
            trial = self
                .probe
                .probe(magnitude)
                .map_err(|_| Halt::DeadEnd(UndeterminedReason::LaunchFailed))?;
        }
        trial.attempts = attempts;
        trial.magnitude = magnitude;

        let category = trial.category;
        self.trials.push(trial);

        let Some(severity) = category.severity() else {
            return Err(Halt::DeadEnd(UndeterminedReason::Unstable));
        };

        // Monotonicity check against everything observed so far: severity
        // must not regress as magnitude grows.
        for (&other_m, &other_c) in &self.cache {
            let other_sev = other_c.severity().unwrap_or(SEV_SAFE);
            let regressed = (other_m < magnitude && other_sev > severity)
                || (other_m > magnitude && other_sev < severity);
            if regressed {
                let (lower_m, upper_m) = if other_m < magnitude {
                    (other_m, magnitude)
                } else {
                    (magnitude, other_m)
                };
                self.anomaly = Some(Anomaly {
                    lower: self.last_trial(lower_m),
                    upper: self.last_trial(upper_m),
                });
                return Err(Halt::Anomaly);
            }
        }

        self.cache.insert(magnitude, category);
        Ok(category)
    }

    fn last_trial(&self, magnitude: u32) -> Trial {
        self.trials
            .iter()
            .rev()
            .find(|t| t.magnitude == magnitude)
            .cloned()
            .unwrap_or_else(|| Trial::synthetic(magnitude, Category::Safe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Deterministic probe with step thresholds: SAFE below `detect_at`,
    /// CANARY_DETECTED from `detect_at` up to `bypass_at`, BYPASSED beyond.
    struct StepProbe {
        detect_at: u32,
        bypass_at: u32,
        calls: u32,
        seen: HashSet<u32>,
    }

    impl StepProbe {
        fn new(detect_at: u32, bypass_at: u32) -> Self {
            Self {
                detect_at,
                bypass_at,
                calls: 0,
                seen: HashSet::new(),
            }
        }
    }

    impl Probe for StepProbe {
        fn probe(&mut self, magnitude: u32) -> Result<Trial, ProbeFault> {
            self.calls += 1;
            assert!(
                self.seen.insert(magnitude),
                "magnitude {magnitude} probed twice; cache should prevent this"
            );
            let category = if magnitude >= self.bypass_at {
                Category::Bypassed
            } else if magnitude >= self.detect_at {
                Category::CanaryDetected
            } else {
                Category::Safe
            };
            Ok(Trial::synthetic(magnitude, category))
        }
    }

    #[test]
    fn finds_both_boundaries_of_a_protected_fixed_buffer() {
        // 64-byte buffer under protection: canary fires just past the
        // buffer, the return address is only reached much later.
        let mut probe = StepProbe::new(65, 129);
        let engine = SearchEngine::new(64);

        let outcome = engine.find_boundaries(&mut probe, 0, 256);
        assert_eq!(outcome.detection, Boundary::At(65));
        assert_eq!(outcome.bypass, Boundary::At(129));
        assert_eq!(outcome.verdict, Verdict::DetectedThenBypassed);
        assert!(outcome.anomaly.is_none());
    }

    #[test]
    fn silent_bypass_reports_no_detection_boundary() {
        // Canary never engages; first fault is already a memory fault.
        struct SilentProbe;
        impl Probe for SilentProbe {
            fn probe(&mut self, magnitude: u32) -> Result<Trial, ProbeFault> {
                let category = if magnitude >= 100 {
                    Category::Bypassed
                } else {
                    Category::Safe
                };
                Ok(Trial::synthetic(magnitude, category))
            }
        }

        let engine = SearchEngine::new(64);
        let outcome = engine.find_boundaries(&mut SilentProbe, 0, 4096);
        assert_eq!(
            outcome.detection,
            Boundary::Undetermined(UndeterminedReason::NeverObserved)
        );
        assert_eq!(outcome.bypass, Boundary::At(100));
        assert_eq!(outcome.verdict, Verdict::SilentBypass);
    }

    #[test]
    fn all_safe_range_yields_no_fault() {
        let mut probe = StepProbe::new(10_000, 20_000);
        let engine = SearchEngine::new(64);

        let outcome = engine.find_boundaries(&mut probe, 0, 4096);
        assert_eq!(
            outcome.detection,
            Boundary::Undetermined(UndeterminedReason::NeverObserved)
        );
        assert_eq!(
            outcome.bypass,
            Boundary::Undetermined(UndeterminedReason::NeverObserved)
        );
        assert_eq!(outcome.verdict, Verdict::NoFault);
        // Endpoints only; nothing in between is worth probing.
        assert_eq!(outcome.probes_issued, 2);
    }

    #[test]
    fn converges_within_logarithmic_probe_count() {
        let mut probe = StepProbe::new(1234, 3456);
        let engine = SearchEngine::new(64);

        let outcome = engine.find_boundaries(&mut probe, 0, 4096);
        assert_eq!(outcome.detection, Boundary::At(1234));
        assert_eq!(outcome.bypass, Boundary::At(3456));
        // Two boundaries over a 4096 range share a cache: at most
        // 2 * (log2(4096) + 2) distinct magnitudes.
        assert!(
            outcome.probes_issued <= 28,
            "issued {} probes",
            outcome.probes_issued
        );
        assert_eq!(outcome.probes_issued, probe.calls);
    }

    #[test]
    fn fault_at_the_lower_bound_is_the_boundary() {
        let mut probe = StepProbe::new(0, 50);
        let engine = SearchEngine::new(64);

        let outcome = engine.find_boundaries(&mut probe, 0, 256);
        assert_eq!(outcome.detection, Boundary::At(0));
        assert_eq!(outcome.bypass, Boundary::At(50));
    }

    #[test]
    fn noisy_probe_is_retried_once_at_the_same_magnitude() {
        struct FlakyProbe {
            failed_once: HashSet<u32>,
        }
        impl Probe for FlakyProbe {
            fn probe(&mut self, magnitude: u32) -> Result<Trial, ProbeFault> {
                if self.failed_once.insert(magnitude) {
                    return Ok(Trial::synthetic(magnitude, Category::Inconclusive));
                }
                let category = if magnitude >= 64 {
                    Category::CanaryDetected
                } else {
                    Category::Safe
                };
                Ok(Trial::synthetic(magnitude, category))
            }
        }

        let engine = SearchEngine::new(64);
        let mut probe = FlakyProbe {
            failed_once: HashSet::new(),
        };
        let outcome = engine.find_boundaries(&mut probe, 0, 256);
        assert_eq!(outcome.detection, Boundary::At(64));
        assert!(outcome.trials.iter().all(|t| t.attempts == 2));
    }

    #[test]
    fn persistent_timeout_leaves_boundaries_undetermined() {
        struct HangingProbe;
        impl Probe for HangingProbe {
            fn probe(&mut self, magnitude: u32) -> Result<Trial, ProbeFault> {
                let mut trial = Trial::synthetic(magnitude, Category::Inconclusive);
                trial.timed_out = true;
                Ok(trial)
            }
        }

        let engine = SearchEngine::new(64);
        let outcome = engine.find_boundaries(&mut HangingProbe, 0, 256);
        assert_eq!(
            outcome.detection,
            Boundary::Undetermined(UndeterminedReason::Unstable)
        );
        assert_eq!(
            outcome.bypass,
            Boundary::Undetermined(UndeterminedReason::Unstable)
        );
        assert_eq!(outcome.verdict, Verdict::Undetermined);
    }

    #[test]
    fn launch_failure_is_retried_then_surfaced() {
        struct DeadProbe {
            calls: u32,
        }
        impl Probe for DeadProbe {
            fn probe(&mut self, _magnitude: u32) -> Result<Trial, ProbeFault> {
                self.calls += 1;
                Err(ProbeFault::Launch("binary missing".into()))
            }
        }

        let engine = SearchEngine::new(64);
        let mut probe = DeadProbe { calls: 0 };
        let outcome = engine.find_boundaries(&mut probe, 0, 256);
        assert_eq!(
            outcome.detection,
            Boundary::Undetermined(UndeterminedReason::LaunchFailed)
        );
        assert!(probe.calls >= 2, "launch fault must be retried once");
    }

    #[test]
    fn monotonicity_violation_halts_with_an_anomaly() {
        // Severity regresses: bypass in the middle band, detection above it.
        struct RegressingProbe;
        impl Probe for RegressingProbe {
            fn probe(&mut self, magnitude: u32) -> Result<Trial, ProbeFault> {
                let category = if magnitude >= 192 {
                    Category::CanaryDetected
                } else if magnitude >= 64 {
                    Category::Bypassed
                } else {
                    Category::Safe
                };
                Ok(Trial::synthetic(magnitude, category))
            }
        }

        let engine = SearchEngine::new(64);
        let outcome = engine.find_boundaries(&mut RegressingProbe, 0, 256);
        let anomaly = outcome.anomaly.expect("anomaly must be recorded");
        assert!(anomaly.lower.magnitude < anomaly.upper.magnitude);
        assert!(
            anomaly.lower.category.severity() > anomaly.upper.category.severity(),
            "conflicting trials must show the regression"
        );
        assert_eq!(
            outcome.detection,
            Boundary::Undetermined(UndeterminedReason::Anomaly)
        );
        assert_eq!(
            outcome.bypass,
            Boundary::Undetermined(UndeterminedReason::Anomaly)
        );
        assert_eq!(outcome.verdict, Verdict::Undetermined);
    }

    #[test]
    fn probe_budget_exhaustion_is_reported() {
        let mut probe = StepProbe::new(1234, 3456);
        let engine = SearchEngine::new(3);

        let outcome = engine.find_boundaries(&mut probe, 0, 1 << 20);
        assert_eq!(outcome.probes_issued, 3);
        assert!(matches!(
            outcome.detection,
            Boundary::Undetermined(UndeterminedReason::Exhausted)
        ));
    }

    #[test]
    fn repeated_searches_are_deterministic() {
        let engine = SearchEngine::new(64);
        let first = engine.find_boundaries(&mut StepProbe::new(65, 129), 0, 256);
        let second = engine.find_boundaries(&mut StepProbe::new(65, 129), 0, 256);
        assert_eq!(first.detection, second.detection);
        assert_eq!(first.bypass, second.bypass);
        assert_eq!(first.probes_issued, second.probes_issued);
    }
}
