use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

/// Blocking command execution: one external command at a time, optional timeout.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    default_timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands without an explicit timeout are bounded by `timeout`.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }

    pub fn run(&self, request: Cmd) -> Result<ExecOutput> {
        tracing::debug!(command = %request.display(), cwd = ?request.cwd, "exec");
        let mut cmd = request.command();
        cmd.stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else if request.capture_output {
            Stdio::null()
        } else {
            Stdio::inherit()
        });
        request.apply_output(&mut cmd);
        let mut child = spawn(&mut cmd, &request)?;

        let writer = match (child.stdin.take(), request.stdin.clone()) {
            (Some(mut pipe), Some(payload)) => Some(thread::spawn(move || -> io::Result<()> {
                pipe.write_all(&payload)?;
                Ok(())
            })),
            _ => None,
        };
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let started = Instant::now();
        let status = match request.timeout.or(self.default_timeout) {
            None => child.wait().context("failed to wait for process")?,
            Some(timeout) => match child
                .wait_timeout(timeout)
                .context("failed to wait with timeout")?
            {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(anyhow!(
                        "command {} timed out after {:?}",
                        request.display(),
                        timeout
                    ));
                }
            },
        };

        if let Some(w) = writer {
            // A child that exits without draining stdin (e.g. `test -f`) is not an error.
            let _ = w.join();
        }
        let stdout = join_reader(stdout_reader)?;
        let stderr = join_reader(stderr_reader)?;
        tracing::debug!(
            command = %request.display(),
            code = ?status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exec finished"
        );

        Ok(ExecOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Run and fail on non-zero exit, carrying the command and its stderr in the error.
    pub fn run_checked(&self, request: Cmd) -> Result<ExecOutput> {
        let shown = request.display();
        let out = self.run(request)?;
        if !out.status.success() {
            let detail = out.stderr.trim();
            return Err(if detail.is_empty() {
                anyhow!("`{}` exited with {}", shown, describe_status(&out.status))
            } else {
                anyhow!(
                    "`{}` exited with {}: {}",
                    shown,
                    describe_status(&out.status),
                    detail
                )
            });
        }
        Ok(out)
    }

    /// Run `producer | consumer` with the data streamed between them, never buffered here.
    ///
    /// The returned output is the consumer's; a failing producer is an error.
    pub fn pipe(&self, producer: Cmd, consumer: Cmd) -> Result<ExecOutput> {
        tracing::debug!(
            producer = %producer.display(),
            consumer = %consumer.display(),
            "exec pipe"
        );
        let mut src = producer.command();
        src.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut src_child = spawn(&mut src, &producer)?;
        let src_err = src_child.stderr.take().map(spawn_reader);
        let data = src_child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout pipe for {}", producer.display()))?;

        let mut dst = consumer.command();
        dst.stdin(Stdio::from(data));
        consumer.apply_output(&mut dst);
        let dst_child = match spawn(&mut dst, &consumer) {
            Ok(c) => c,
            Err(e) => {
                let _ = src_child.kill();
                let _ = src_child.wait();
                return Err(e);
            }
        };
        drop(dst);
        let out = dst_child
            .wait_with_output()
            .context("failed to wait for pipe consumer")?;
        let src_status = src_child
            .wait()
            .context("failed to wait for pipe producer")?;
        let src_stderr = join_reader(src_err)?;
        if !src_status.success() {
            return Err(anyhow!(
                "`{}` exited with {}: {}",
                producer.display(),
                describe_status(&src_status),
                src_stderr.trim()
            ));
        }
        Ok(ExecOutput {
            status: out.status,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

fn spawn(cmd: &mut Command, request: &Cmd) -> Result<std::process::Child> {
    cmd.spawn().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            anyhow::Error::new(crate::DevError::NotFound(format!(
                "{} not found in PATH",
                request.program.to_string_lossy()
            )))
        } else {
            anyhow::Error::new(e).context(format!("failed to spawn {}", request.display()))
        }
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn join_reader(handle: Option<thread::JoinHandle<io::Result<String>>>) -> Result<String> {
    match handle {
        None => Ok(String::new()),
        Some(h) => h
            .join()
            .map_err(|_| anyhow!("output reader thread panicked"))?
            .context("failed to read process output"),
    }
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(c) => format!("exit code {c}"),
        None => "a signal".to_string(),
    }
}

/// One external command invocation. Inherits the caller's environment; `env` adds to it.
#[derive(Debug, Default, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
    capture_output: bool,
    quiet: bool,
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `data` to the child's stdin; implies nothing about output capture.
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Discard output instead of inheriting the terminal (ignored when capturing).
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn apply_output(&self, cmd: &mut Command) {
        if self.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else if self.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    /// Shell-style rendering for logs and previews.
    pub fn display(&self) -> String {
        let mut words = vec![self.program.to_string_lossy().into_owned()];
        words.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        crate::util::shell_join(&words)
    }
}

#[derive(Debug)]
pub struct ExecOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}
