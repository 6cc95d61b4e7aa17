//! Spawns `cryptsetup` and its helpers with a timeout, feeding secrets over
//! stdin so they never show up in the process table.

use blockvault_core::error::{BlockvaultError, BlockvaultResult};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
/// Wraps a concrete binary path and timeout.
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
/// Collects stdout, stderr, and exit status from a finished command.
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    /// Stderr if it has content, otherwise stdout.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Validate that `path` exists before wrapping it.
    pub fn with_path(path: PathBuf, timeout: Duration) -> BlockvaultResult<Self> {
        if !path.exists() {
            return Err(BlockvaultError::InvalidConfig(format!(
                "binary not found at {}",
                path.display()
            )));
        }
        Ok(Self::new(path, timeout))
    }

    /// First existing candidate, if any.
    pub fn discover(candidates: &[&str], timeout: Duration) -> Option<Self> {
        candidates
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| Self::new(path.to_path_buf(), timeout))
    }

    pub fn binary(&self) -> &Path {
        &self.path
    }

    /// Execute the binary with arguments and an optional stdin payload.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> BlockvaultResult<Output> {
        let mut command = Command::new(&self.path);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            BlockvaultError::CipherEngine(format!("failed to spawn {}: {err}", self.path.display()))
        })?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(bytes) {
                    Ok(()) => {
                        stdin.flush().ok();
                    }
                    // The tool may exit before reading its key; its status tells the story.
                    Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> BlockvaultResult<Output> {
        let start = Instant::now();
        let stdout_handle = Self::spawn_output_reader(stdout_pipe);
        let stderr_handle = Self::spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BlockvaultError::CipherEngine(format!(
                "{} timed out after {:?}",
                self.path.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| BlockvaultError::CipherEngine("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| BlockvaultError::CipherEngine("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }

    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<BlockvaultResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> BlockvaultResult<String> {
            if let Some(mut reader) = pipe {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(String::from_utf8_lossy(&buf).to_string())
            } else {
                Ok(String::new())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_output_and_status() {
        let runner = CommandRunner::new(PathBuf::from("/bin/sh"), Duration::from_secs(5));
        let out = runner
            .run(&["-c", "cat; echo oops >&2; exit 3"], Some(b"payload"))
            .unwrap();
        assert_eq!(out.stdout, "payload");
        assert_eq!(out.status, 3);
        assert_eq!(out.diagnostic(), "oops");
    }

    #[test]
    fn run_times_out() {
        let runner = CommandRunner::new(PathBuf::from("/bin/sh"), Duration::from_millis(100));
        let err = runner.run(&["-c", "sleep 5"], None).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[test]
    fn discover_skips_missing_candidates() {
        let runner =
            CommandRunner::discover(&["/nonexistent/cryptsetup", "/bin/sh"], Duration::from_secs(1))
                .unwrap();
        assert_eq!(runner.binary(), Path::new("/bin/sh"));
        assert!(CommandRunner::discover(&["/nonexistent/x"], Duration::from_secs(1)).is_none());
    }
}
