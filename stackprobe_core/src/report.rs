use crate::search::{Anomaly, Boundary, SearchOutcome, Trial, UndeterminedReason, Verdict};
use crate::variant::{Arch, CorruptionPattern, ProtectionLevel, SeedVariant};
use serde::Serialize;

/// Terminal artifact per build: the located boundaries, the verdict, and
/// the trial history needed to audit them. Produced exactly once per
/// (SeedVariant x BuildConfig) cell.
#[derive(Serialize, Debug, Clone)]
pub struct Finding {
    pub variant_id: String,
    pub arch: Arch,
    pub pattern: CorruptionPattern,
    pub protection: ProtectionLevel,
    pub build_key: Option<String>,
    pub detection: Boundary,
    pub bypass: Boundary,
    pub verdict: Verdict,
    pub anomaly: Option<Anomaly>,
    pub trials: Vec<Trial>,
    /// Compiler diagnostics for failed builds.
    pub diagnostics: Option<String>,
}

impl Finding {
    pub fn from_search(
        variant: &SeedVariant,
        protection: ProtectionLevel,
        build_key: Option<String>,
        outcome: SearchOutcome,
    ) -> Self {
        Finding {
            variant_id: variant.id.clone(),
            arch: variant.arch,
            pattern: variant.pattern,
            protection,
            build_key,
            detection: outcome.detection,
            bypass: outcome.bypass,
            verdict: outcome.verdict,
            anomaly: outcome.anomaly,
            trials: outcome.trials,
            diagnostics: None,
        }
    }

    pub fn build_failed(
        variant: &SeedVariant,
        protection: ProtectionLevel,
        diagnostics: String,
        build_key: Option<String>,
    ) -> Self {
        Finding {
            variant_id: variant.id.clone(),
            arch: variant.arch,
            pattern: variant.pattern,
            protection,
            build_key,
            detection: Boundary::Undetermined(UndeterminedReason::NotSearched),
            bypass: Boundary::Undetermined(UndeterminedReason::NotSearched),
            verdict: Verdict::BuildFailed,
            anomaly: None,
            trials: Vec::new(),
            diagnostics: Some(diagnostics),
        }
    }
}

/// A pattern that evades an enabled protection level while the fixed-array
/// pattern under the same flags detects cleanly. The finding class the
/// whole oracle exists to surface.
#[derive(Serialize, Debug, Clone)]
pub struct BypassSignature {
    pub arch: Arch,
    pub protection: ProtectionLevel,
    pub implicated: CorruptionPattern,
    /// Allocation strategy implicated by the pattern: "vla", "alloca", or
    /// "none" for patterns that evade without a dynamic allocation.
    pub allocation_strategy: &'static str,
    pub variant_id: String,
    /// The fixed-array variant that proves the protection works at all
    /// under these flags.
    pub reference_variant: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub signatures: Vec<BypassSignature>,
}

/// Groups findings by pattern and derives cross-variant comparisons.
///
/// Sanitizer builds are ground truth only; they never participate in
/// signature derivation.
pub fn aggregate(mut findings: Vec<Finding>) -> Report {
    findings.sort_by(|a, b| {
        (a.pattern.label(), a.arch.to_string(), a.protection.label(), &a.variant_id).cmp(&(
            b.pattern.label(),
            b.arch.to_string(),
            b.protection.label(),
            &b.variant_id,
        ))
    });

    let mut signatures = Vec::new();
    for finding in &findings {
        if finding.verdict != Verdict::SilentBypass {
            continue;
        }
        if !matches!(
            finding.protection,
            ProtectionLevel::Strong | ProtectionLevel::All
        ) {
            continue;
        }
        // Only a bypass signature if the same flags demonstrably protect
        // the fixed-allocation case on this architecture.
        let reference = findings.iter().find(|other| {
            other.arch == finding.arch
                && other.protection == finding.protection
                && other.pattern == CorruptionPattern::FixedArray
                && matches!(
                    other.verdict,
                    Verdict::Protected | Verdict::DetectedThenBypassed
                )
        });
        if let Some(reference) = reference {
            signatures.push(BypassSignature {
                arch: finding.arch,
                protection: finding.protection,
                implicated: finding.pattern,
                allocation_strategy: if finding.pattern.is_dynamic_alloc() {
                    finding.pattern.label()
                } else {
                    "none"
                },
                variant_id: finding.variant_id.clone(),
                reference_variant: reference.variant_id.clone(),
            });
        }
    }

    Report {
        findings,
        signatures,
    }
}
