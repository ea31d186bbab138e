//! Subprocess-backed filter pipeline.
//!
//! One element per line goes into the child's stdin from a dedicated feeder
//! thread; the drainer runs on the calling thread and forwards each
//! complete stdout line downstream. The two directions must be concurrent:
//! a streaming filter can block for more input while it still has output
//! pending, and a synchronous write-then-read protocol would deadlock on a
//! full pipe in either direction. stderr is pumped into a capture buffer on
//! a third thread so the child can never stall on a full stderr pipe.

use std::{
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::{core::cancel::CancellationToken, error::PipelineError};

use super::{FilterCommand, LinePull, LinePush, LineTransducer, TransducerReport};

/// Runs the configured filter program as a child process. The child never
/// outlives the run: every exit path, including panics, goes through
/// [`ChildGuard`].
pub struct SubprocessTransducer {
    command: FilterCommand,
}

impl SubprocessTransducer {
    pub fn new(command: FilterCommand) -> Self {
        Self { command }
    }
}

/// What the feeder thread observed.
struct FeedOutcome {
    fed: usize,
    /// Upstream (splitter/decompressor/source) failure, reported in
    /// preference to anything the child did in response.
    input_error: Option<PipelineError>,
    /// The child closed its stdin before end of input.
    pipe_closed_early: bool,
}

impl LineTransducer for SubprocessTransducer {
    fn transduce(
        &mut self,
        input: LinePull<'_>,
        output: LinePush<'_>,
        cancel: &CancellationToken,
    ) -> Result<TransducerReport, PipelineError> {
        let mut command = Command::new(self.command.program());
        command
            .args(self.command.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("spawning filter process: {:?}", command);
        let mut child = command.spawn().map_err(|err| PipelineError::FilterProcess {
            exit_code: None,
            stderr: format!("failed to spawn '{}': {}", self.command.program(), err),
        })?;

        // all three pipes exist, we just asked for them
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdin, stdout, mut stderr) = match (stdin, stdout, stderr) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                return Err(PipelineError::FilterProcess {
                    exit_code: None,
                    stderr: "filter process pipes were not created".to_string(),
                })
            }
        };

        let guard = Mutex::new(ChildGuard::new(child));
        let drained = AtomicBool::new(false);
        let mut lines_out = 0usize;
        let mut sink_error: Option<PipelineError> = None;
        let mut drain_error: Option<String> = None;
        let mut tail: Vec<u8> = Vec::new();

        let (feed_outcome, stderr_text) = thread::scope(|scope| {
            let feeder = scope.spawn(|| {
                let outcome = feed(stdin, input, cancel);
                // the drainer can sit blocked in a read on a child that
                // ignores stdin-EOF, so this thread stays behind as the
                // watchdog that enforces cancellation with a kill
                while !drained.load(Ordering::Acquire) {
                    if cancel.is_cancelled() {
                        kill_child(&guard);
                        break;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                outcome
            });
            let stderr_pump = scope.spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            });

            let mut reader = BufReader::new(stdout);
            let mut line: Vec<u8> = Vec::new();
            loop {
                if cancel.is_cancelled() {
                    // unblocks the child and, through broken pipes, the feeder
                    kill_child(&guard);
                    break;
                }
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if line.last() == Some(&b'\n') {
                            line.pop();
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            if let Err(err) = output(&line) {
                                sink_error = Some(err);
                                kill_child(&guard);
                                break;
                            }
                            lines_out += 1;
                        } else {
                            // unterminated final line: forwarded only if the
                            // child turns out to have exited cleanly
                            tail = line.clone();
                        }
                    }
                    Err(err) => {
                        drain_error = Some(err.to_string());
                        kill_child(&guard);
                        break;
                    }
                }
            }

            drained.store(true, Ordering::Release);
            let feed_outcome = feeder.join();
            let stderr_text = stderr_pump.join().unwrap_or_default();
            (feed_outcome, stderr_text)
        });

        let mut guard = guard.into_inner().unwrap_or_else(PoisonError::into_inner);

        let outcome = feed_outcome.unwrap_or_else(|_| FeedOutcome {
            fed: 0,
            input_error: Some(PipelineError::FilterProcess {
                exit_code: None,
                stderr: "feeder thread panicked".to_string(),
            }),
            pipe_closed_early: false,
        });

        if let Some(err) = outcome.input_error {
            guard.kill();
            let _ = guard.wait();
            return Err(err);
        }

        if let Some(err) = sink_error {
            let _ = guard.wait();
            return Err(err);
        }

        if cancel.is_cancelled() {
            let _ = guard.wait();
            debug!("filter cancelled after {} lines in, {} out", outcome.fed, lines_out);
            return Ok(TransducerReport {
                lines_in: outcome.fed,
                lines_out,
            });
        }

        let status = guard.wait().map_err(|err| PipelineError::FilterProcess {
            exit_code: None,
            stderr: format!("failed to reap filter process: {err}"),
        })?;

        if !status.success() {
            warn!("filter process exited with {status}");
            return Err(PipelineError::FilterProcess {
                exit_code: status.code(),
                stderr: stderr_text.trim().to_string(),
            });
        }

        if let Some(detail) = drain_error {
            return Err(PipelineError::FilterProcess {
                exit_code: status.code(),
                stderr: format!("error reading filter output: {detail}"),
            });
        }

        if outcome.pipe_closed_early {
            return Err(PipelineError::FilterProcess {
                exit_code: status.code(),
                stderr: format!(
                    "filter closed its input after {} lines, before end of stream; stderr: {}",
                    outcome.fed,
                    stderr_text.trim()
                ),
            });
        }

        if !tail.is_empty() {
            output(&tail)?;
            lines_out += 1;
        }

        debug!("filter done: {} lines in, {} out", outcome.fed, lines_out);
        Ok(TransducerReport {
            lines_in: outcome.fed,
            lines_out,
        })
    }
}

/// Feeder: pulls elements and writes one per line until the input is
/// exhausted, then closes the child's stdin by dropping it, signaling end
/// of input.
fn feed(stdin: ChildStdin, input: LinePull<'_>, cancel: &CancellationToken) -> FeedOutcome {
    let mut writer = BufWriter::new(stdin);
    let mut fed = 0usize;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match input() {
            Ok(Some(element)) => {
                let wrote = writer
                    .write_all(&element)
                    .and_then(|_| writer.write_all(b"\n"));
                if let Err(err) = wrote {
                    return FeedOutcome {
                        fed,
                        input_error: None,
                        pipe_closed_early: is_pipe_close(&err),
                    };
                }
                fed += 1;
            }
            Ok(None) => break,
            // a cancelled upstream surfaces its abort as an error; the run
            // was asked to stop, so it is not a failure
            Err(_) if cancel.is_cancelled() => break,
            Err(err) => {
                return FeedOutcome {
                    fed,
                    input_error: Some(err),
                    pipe_closed_early: false,
                }
            }
        }
    }

    if let Err(err) = writer.flush() {
        return FeedOutcome {
            fed,
            input_error: None,
            pipe_closed_early: is_pipe_close(&err),
        };
    }

    FeedOutcome {
        fed,
        input_error: None,
        pipe_closed_early: false,
    }
}

fn is_pipe_close(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero)
}

/// Kill through the shared guard; both the drainer and the watchdog may
/// race here, and kill is idempotent.
fn kill_child(guard: &Mutex<ChildGuard>) {
    if let Ok(mut guard) = guard.lock() {
        guard.kill();
    }
}

/// Owns the child and guarantees it is reaped: any path that drops the
/// guard without waiting kills the process first. The subprocess must never
/// outlive the pipeline.
struct ChildGuard {
    child: Child,
    waited: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            waited: false,
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.waited = true;
        self.child.wait()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.waited {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
