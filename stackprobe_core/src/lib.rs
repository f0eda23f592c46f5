pub mod builder;
pub mod classify;
pub mod config;
pub mod matrix;
pub mod report;
pub mod sandbox;
pub mod search;
pub mod variant;

pub use builder::{Build, BuildArtifact, BuildCache, BuildError};
pub use classify::{Category, classify};
pub use config::StackprobeConfig;
pub use matrix::{MatrixError, MatrixSettings, Orchestrator, SandboxProbe};
pub use report::{BypassSignature, Finding, Report, aggregate};
pub use sandbox::{RawOutcome, Sandbox, SandboxConfig, SandboxError};
pub use search::{
    Anomaly, Boundary, Probe, ProbeFault, SearchEngine, SearchOutcome, Trial, UndeterminedReason,
    Verdict,
};
pub use variant::{
    Arch, BuildConfig, CompilerSpec, CorruptionPattern, ProbeParams, ProtectionLevel, SeedVariant,
};
