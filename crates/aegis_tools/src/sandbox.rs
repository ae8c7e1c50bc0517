//! Subprocess sandbox for untrusted scripts.
//!
//! Blast-radius reducer, NOT a security boundary: a child with a kernel
//! exploit escapes it. Layers, in order of importance:
//! 1. Isolated-interpreter flags (`-I -S`: no user site, no implicit paths)
//! 2. Empty environment
//! 3. Fresh temporary working directory, removed on return
//! 4. POSIX rlimits applied before exec (CPU, address space, file size, fds)
//! 5. Wall-clock timeout enforced by the parent, child killed and reaped

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_WALL_TIMEOUT: Duration = Duration::from_secs(10);
const CPU_SECONDS: u64 = 2;
const ADDRESS_SPACE_BYTES: u64 = 256 * 1024 * 1024;
const FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_OPEN_FILES: u64 = 64;

pub struct CodeSandbox {
    interpreter: String,
    wall_timeout: Duration,
}

impl Default for CodeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeSandbox {
    pub fn new() -> Self {
        Self { interpreter: "python3".into(), wall_timeout: DEFAULT_WALL_TIMEOUT }
    }

    pub fn with_interpreter(interpreter: impl Into<String>, wall_timeout: Duration) -> Self {
        Self { interpreter: interpreter.into(), wall_timeout }
    }

    /// Run `code` in a fresh child process.
    ///
    /// Returns `(stdout, stderr, returncode)`. Wall-clock timeout yields
    /// `("", "Execution timeout", -1)`; a spawn failure yields
    /// `("", "Execution error: <msg>", -1)`. Never errors.
    pub async fn execute(&self, code: &str) -> (String, String, i32) {
        match self.try_execute(code).await {
            Ok(result) => result,
            Err(e) => (String::new(), format!("Execution error: {e}"), -1),
        }
    }

    async fn try_execute(&self, code: &str) -> std::io::Result<(String, String, i32)> {
        let workdir = tempfile::tempdir()?;
        let script = workdir.path().join("script.py");
        tokio::fs::write(&script, code).await?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-I")
            .arg("-S")
            .arg(&script)
            .current_dir(workdir.path())
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                apply_rlimits();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let mut out = String::new();
        let mut err = String::new();
        let waited = tokio::time::timeout(self.wall_timeout, async {
            let (status, _, _) = tokio::join!(
                child.wait(),
                async {
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        let _ = pipe.read_to_string(&mut out).await;
                    }
                },
                async {
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_string(&mut err).await;
                    }
                },
            );
            status
        })
        .await;

        match waited {
            Ok(Ok(status)) => Ok((out, err, status.code().unwrap_or(-1))),
            Ok(Err(e)) => Ok((String::new(), format!("Execution error: {e}"), -1)),
            Err(_elapsed) => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "sandbox child already gone at kill");
                }
                Ok((String::new(), "Execution timeout".into(), -1))
            }
        }
    }
}

/// Resource caps installed between fork and exec. Failures are ignored on
/// purpose: a cap the platform refuses must not block execution entirely.
#[cfg(unix)]
fn apply_rlimits() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    type Resource = libc::c_int;

    fn cap(resource: Resource, limit: u64) {
        let lim = libc::rlimit { rlim_cur: limit, rlim_max: limit };
        unsafe {
            libc::setrlimit(resource, &lim);
        }
    }

    cap(libc::RLIMIT_CPU, CPU_SECONDS);
    cap(libc::RLIMIT_AS, ADDRESS_SPACE_BYTES);
    cap(libc::RLIMIT_FSIZE, FILE_SIZE_BYTES);
    cap(libc::RLIMIT_NOFILE, MAX_OPEN_FILES);
}
