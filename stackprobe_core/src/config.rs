use crate::matrix::MatrixSettings;
use crate::sandbox::SandboxConfig;
use crate::variant::{Arch, BuildConfig, CompilerSpec, CorruptionPattern, ProtectionLevel, SeedVariant};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SandboxSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub address_space_limit_bytes: Option<u64>,
    pub stack_limit_bytes: Option<u64>,
    #[serde(default = "default_capture_limit")]
    pub capture_limit_bytes: usize,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_capture_limit() -> usize {
    8192
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            address_space_limit_bytes: None,
            stack_limit_bytes: None,
            capture_limit_bytes: default_capture_limit(),
        }
    }
}

impl SandboxSettings {
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            address_space_limit: self.address_space_limit_bytes,
            stack_limit: self.stack_limit_bytes,
            capture_limit: self.capture_limit_bytes,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MatrixSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_magnitude")]
    pub max_magnitude: u32,
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,
    #[serde(default = "default_alloc_size")]
    pub default_alloc_size: u32,
}

pub fn default_workers() -> usize {
    4
}
pub fn default_max_magnitude() -> u32 {
    4096
}
pub fn default_max_probes() -> u32 {
    64
}
pub fn default_alloc_size() -> u32 {
    64
}

impl Default for MatrixSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_magnitude: default_max_magnitude(),
            max_probes: default_max_probes(),
            default_alloc_size: default_alloc_size(),
        }
    }
}

impl MatrixSection {
    pub fn to_matrix_settings(&self) -> MatrixSettings {
        MatrixSettings {
            workers: self.workers,
            max_magnitude: self.max_magnitude,
            max_probes: self.max_probes,
            default_alloc_size: self.default_alloc_size,
        }
    }
}

/// Per-level flag overrides for one compiler entry. Any level left out falls
/// back to the built-in flag set for that level.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FlagOverrides {
    pub none: Option<Vec<String>>,
    pub strong: Option<Vec<String>>,
    pub all: Option<Vec<String>>,
    pub sanitizer: Option<Vec<String>>,
}

impl FlagOverrides {
    pub fn flags_for(&self, level: ProtectionLevel) -> Vec<String> {
        let overridden = match level {
            ProtectionLevel::None => &self.none,
            ProtectionLevel::Strong => &self.strong,
            ProtectionLevel::All => &self.all,
            ProtectionLevel::Sanitizer => &self.sanitizer,
        };
        overridden.clone().unwrap_or_else(|| level.default_flags())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CompilerEntry {
    pub name: String,
    pub arch: Arch,
    /// Invocation template; `{input}`, `{output}` and `{flags}` expand at
    /// build time.
    pub argv: Vec<String>,
    #[serde(default = "default_levels")]
    pub levels: Vec<ProtectionLevel>,
    #[serde(default)]
    pub flags: FlagOverrides,
}

fn default_levels() -> Vec<ProtectionLevel> {
    vec![
        ProtectionLevel::None,
        ProtectionLevel::Strong,
        ProtectionLevel::All,
        ProtectionLevel::Sanitizer,
    ]
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SeedEntry {
    pub id: String,
    pub arch: Arch,
    pub pattern: CorruptionPattern,
    pub source: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StackprobeConfig {
    #[serde(default)]
    pub sandbox: Option<SandboxSettings>,
    #[serde(default)]
    pub matrix: Option<MatrixSection>,
    pub compilers: Vec<CompilerEntry>,
    pub seeds: Vec<SeedEntry>,
}

impl StackprobeConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: StackprobeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.compilers.is_empty() {
            anyhow::bail!("config must declare at least one [[compilers]] entry");
        }
        if self.seeds.is_empty() {
            anyhow::bail!("config must declare at least one [[seeds]] entry");
        }
        let mut ids: Vec<&str> = self.seeds.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        for pair in ids.windows(2) {
            if pair[0] == pair[1] {
                anyhow::bail!("duplicate seed id '{}'", pair[0]);
            }
        }
        Ok(())
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        self.sandbox
            .clone()
            .unwrap_or_default()
            .to_sandbox_config()
    }

    pub fn matrix_settings(&self) -> MatrixSettings {
        self.matrix.clone().unwrap_or_default().to_matrix_settings()
    }

    /// Expands every compiler entry into one build configuration per
    /// protection level it lists.
    pub fn build_configs(&self) -> Vec<BuildConfig> {
        let mut configs = Vec::new();
        for entry in &self.compilers {
            for &level in &entry.levels {
                configs.push(BuildConfig {
                    compiler: CompilerSpec {
                        name: entry.name.clone(),
                        argv: entry.argv.clone(),
                    },
                    protection: level,
                    arch: entry.arch,
                    flags: entry.flags.flags_for(level),
                });
            }
        }
        configs
    }

    pub fn seed_variants(&self) -> Vec<SeedVariant> {
        self.seeds
            .iter()
            .map(|entry| SeedVariant {
                id: entry.id.clone(),
                arch: entry.arch,
                pattern: entry.pattern,
                source: entry.source.clone(),
            })
            .collect()
    }
}
