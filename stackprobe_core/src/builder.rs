use crate::variant::{Arch, BuildConfig, CompilerSpec, SeedVariant};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use thiserror::Error;

const MAX_DIAGNOSTICS: usize = 4096;

/// Errors raised while materializing a build. A compiler that runs but
/// rejects the source is not an error; that is a `BuildArtifact::Failed`.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to create build workspace: {0}")]
    Workspace(String),
    #[error("failed to read seed source {path:?}: {reason}")]
    Source { path: PathBuf, reason: String },
    #[error("failed to run compiler '{name}': {reason}")]
    CompilerSpawn { name: String, reason: String },
    #[error("build cache lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
pub enum BuildArtifact {
    Binary(PathBuf),
    Failed { diagnostics: String },
}

/// Materialized artifact of one (SeedVariant x BuildConfig) pair.
#[derive(Debug)]
pub struct Build {
    /// Content hash of source bytes + flags + arch + compiler identity.
    /// Seed content, not the pattern label, keys the cache: two seeds
    /// claiming the same pattern still build separately if their sources
    /// differ.
    pub key: String,
    pub artifact: BuildArtifact,
}

impl Build {
    pub fn binary(&self) -> Option<&Path> {
        match &self.artifact {
            BuildArtifact::Binary(path) => Some(path),
            BuildArtifact::Failed { .. } => None,
        }
    }
}

pub fn build_key(source: &[u8], flags: &[String], arch: Arch, compiler: &str) -> String {
    let mut keyed = Vec::with_capacity(source.len() + 64);
    keyed.extend_from_slice(source);
    for flag in flags {
        keyed.extend_from_slice(flag.as_bytes());
        keyed.push(0);
    }
    keyed.extend_from_slice(arch.to_string().as_bytes());
    keyed.push(0);
    keyed.extend_from_slice(compiler.as_bytes());
    format!("{:x}", md5::compute(&keyed))
}

/// Run-scoped build cache. Identical (source, flags, arch, compiler)
/// combinations compile at most once; artifacts live in a temp workspace
/// for as long as the cache does.
pub struct BuildCache {
    workspace: TempDir,
    entries: Mutex<HashMap<String, Arc<Build>>>,
}

impl BuildCache {
    pub fn new() -> Result<Self, BuildError> {
        let workspace = TempDir::new().map_err(|e| BuildError::Workspace(e.to_string()))?;
        Ok(Self {
            workspace,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Looks the build up by content hash, compiling and registering it
    /// under the cache lock on a miss. Holding the lock across the compile
    /// keeps two workers from racing on the same cache entry.
    pub fn get_or_build(
        &self,
        variant: &SeedVariant,
        config: &BuildConfig,
    ) -> Result<Arc<Build>, BuildError> {
        let source = std::fs::read(&variant.source).map_err(|e| BuildError::Source {
            path: variant.source.clone(),
            reason: e.to_string(),
        })?;
        let key = build_key(&source, &config.flags, config.arch, &config.compiler.name);

        let mut entries = self.entries.lock().map_err(|_| BuildError::Poisoned)?;
        if let Some(build) = entries.get(&key) {
            return Ok(Arc::clone(build));
        }

        let output = self.workspace.path().join(&key);
        let artifact = compile(&config.compiler, &variant.source, &config.flags, &output)?;
        let build = Arc::new(Build {
            key: key.clone(),
            artifact,
        });
        entries.insert(key, Arc::clone(&build));
        Ok(build)
    }
}

/// Expands the compiler's argv template and runs it. `{input}` and
/// `{output}` substitute within an element; a literal `{flags}` element is
/// spliced with the flag set.
fn compile(
    spec: &CompilerSpec,
    input: &Path,
    flags: &[String],
    output: &Path,
) -> Result<BuildArtifact, BuildError> {
    let input_str = input.to_string_lossy();
    let output_str = output.to_string_lossy();

    let mut argv: Vec<String> = Vec::with_capacity(spec.argv.len() + flags.len());
    for element in &spec.argv {
        if element == "{flags}" {
            argv.extend(flags.iter().cloned());
            continue;
        }
        argv.push(
            element
                .replace("{input}", &input_str)
                .replace("{output}", &output_str),
        );
    }
    if argv.is_empty() {
        return Err(BuildError::CompilerSpawn {
            name: spec.name.clone(),
            reason: "empty compiler argv template".to_string(),
        });
    }

    let run = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|e| BuildError::CompilerSpawn {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;

    if run.status.success() {
        Ok(BuildArtifact::Binary(output.to_path_buf()))
    } else {
        let mut diagnostics = String::from_utf8_lossy(&run.stderr).into_owned();
        if diagnostics.len() > MAX_DIAGNOSTICS {
            diagnostics.truncate(MAX_DIAGNOSTICS);
        }
        Ok(BuildArtifact::Failed { diagnostics })
    }
}
