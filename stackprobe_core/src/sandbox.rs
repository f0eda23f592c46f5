use crate::variant::ProbeParams;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised while launching or reaping a candidate process.
///
/// A `Launch` error is never retried at this layer; the search engine decides
/// whether a retry is warranted.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to launch candidate {path:?}: {reason}")]
    Launch { path: PathBuf, reason: String },
    #[error("failed waiting for candidate: {0}")]
    Wait(String),
    #[error("failed to kill timed-out candidate: {0}")]
    Kill(String),
}

/// Raw termination record of one candidate execution. Sealed once returned.
#[derive(Debug, Clone)]
pub struct RawOutcome {
    /// Normal-exit code, if the process exited on its own.
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
    /// Bounded stdout/stderr capture. Diagnostic only; classification never
    /// reads these, since output is unreliable under memory-corruption
    /// crashes.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RawOutcome {
    /// The signal that terminated the process, accepting both the direct
    /// wait-status form and the shell convention of exit status `128 + n`.
    pub fn termination_signal(&self) -> Option<i32> {
        if let Some(sig) = self.signal {
            return Some(sig);
        }
        match self.exit_code {
            Some(code) if (129..=192).contains(&code) => Some(code - 128),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    /// Address-space cap in bytes. Contains pathological VLA/`alloca` sizes
    /// so they fault in the child instead of exhausting the host.
    pub address_space_limit: Option<u64>,
    /// Stack-size cap in bytes.
    pub stack_limit: Option<u64>,
    /// Per-stream capture cap in bytes.
    pub capture_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            address_space_limit: None,
            stack_limit: None,
            capture_limit: 8192,
        }
    }
}

/// Runs one candidate binary with one parameter set under resource limits and
/// a timeout. Each run spawns a fresh child with a clean environment, so no
/// state persists or leaks between trials.
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, binary: &Path, params: &ProbeParams) -> Result<RawOutcome, SandboxError> {
        let mut cmd = Command::new(binary);
        cmd.args(params.argv());
        cmd.env_clear();
        cmd.env("PATH", "/usr/bin:/bin");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        self.apply_limits(&mut cmd);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| SandboxError::Launch {
            path: binary.to_path_buf(),
            reason: e.to_string(),
        })?;

        let stdout_reader = spawn_capture(child.stdout.take(), self.config.capture_limit);
        let stderr_reader = spawn_capture(child.stderr.take(), self.config.capture_limit);

        let waited = self.wait_with_timeout(&mut child, start)?;
        let elapsed = start.elapsed();

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        let outcome = match waited {
            Some(status) => {
                let signal = exit_signal(&status);
                RawOutcome {
                    exit_code: status.code(),
                    signal,
                    timed_out: false,
                    elapsed,
                    stdout,
                    stderr,
                }
            }
            None => RawOutcome {
                exit_code: None,
                signal: None,
                timed_out: true,
                elapsed,
                stdout,
                stderr,
            },
        };
        Ok(outcome)
    }

    #[cfg(unix)]
    fn apply_limits(&self, cmd: &mut Command) {
        use std::os::unix::process::CommandExt;

        let as_limit = self.config.address_space_limit;
        let stack_limit = self.config.stack_limit;
        if as_limit.is_none() && stack_limit.is_none() {
            return;
        }
        unsafe {
            cmd.pre_exec(move || {
                if let Some(bytes) = as_limit {
                    let rl = libc::rlimit {
                        rlim_cur: bytes as libc::rlim_t,
                        rlim_max: bytes as libc::rlim_t,
                    };
                    if unsafe { libc::setrlimit(libc::RLIMIT_AS, &rl) } != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if let Some(bytes) = stack_limit {
                    let rl = libc::rlimit {
                        rlim_cur: bytes as libc::rlim_t,
                        rlim_max: bytes as libc::rlim_t,
                    };
                    if unsafe { libc::setrlimit(libc::RLIMIT_STACK, &rl) } != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    /// Polls the child until it exits or the timeout elapses. Returns `None`
    /// when the child had to be killed.
    fn wait_with_timeout(
        &self,
        child: &mut Child,
        start: Instant,
    ) -> Result<Option<std::process::ExitStatus>, SandboxError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {
                    if start.elapsed() > self.config.timeout {
                        child
                            .kill()
                            .map_err(|e| SandboxError::Kill(e.to_string()))?;
                        // Reap so the pid does not linger.
                        let _ = child.wait();
                        return Ok(None);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(SandboxError::Wait(e.to_string())),
            }
        }
    }
}

fn spawn_capture<R: Read + Send + 'static>(
    stream: Option<R>,
    limit: usize,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let Some(mut stream) = stream else {
            return buf;
        };
        // Keep draining past the cap so a chatty child never blocks on a
        // full pipe.
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if buf.len() < limit {
                        let keep = (limit - buf.len()).min(n);
                        buf.extend_from_slice(&chunk[..keep]);
                    }
                }
            }
        }
        buf
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
