//! Subprocess bridge
//!
//! Runs one archive tool invocation and exposes its stdout as a stream of
//! chunks. The stream completes when the process exits with code 0 and fails
//! with `ChildProcessFailure` otherwise. Dropping the stream kills the process.

use crate::{ArchiveError, ChildProcessFailure};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Number of stderr chunks kept for diagnostics
pub const STDERR_TAIL_CHUNKS: usize = 20;

const READ_CHUNK_SIZE: usize = 8192;

/// Stdout of one invocation
pub type ChunkStream = BoxStream<'static, Result<Bytes, ArchiveError>>;

/// Arguments and optional stdin payload of one archive tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub stdin: Option<Bytes>,
}

impl Invocation {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    /// Feed `payload` to the process's stdin, then close it
    pub fn with_stdin(mut self, payload: impl Into<Bytes>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// The subcommand, i.e. the first argument
    pub fn subcommand(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }
}

/// Starts archive tool invocations
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, invocation: Invocation) -> Result<ChunkStream, ArchiveError>;
}

/// Spawns real child processes of a fixed executable
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, invocation: Invocation) -> Result<ChunkStream, ArchiveError> {
        Ok(Subprocess::spawn(&self.program, invocation)?.into_stream())
    }
}

/// Most recent stderr chunks of a process
#[derive(Debug, Default)]
pub struct StderrTail {
    chunks: VecDeque<Bytes>,
}

impl StderrTail {
    pub fn push(&mut self, chunk: Bytes) {
        if self.chunks.len() == STDERR_TAIL_CHUNKS {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Joined text of the retained chunks
    pub fn to_string_lossy(&self) -> String {
        let joined: Vec<u8> = self.chunks.iter().flatten().copied().collect();
        String::from_utf8_lossy(&joined).into_owned()
    }
}

/// A running archive tool process
pub struct Subprocess {
    command: String,
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<StderrTail>>,
    stdin: Option<JoinHandle<()>>,
}

impl Subprocess {
    /// Spawn `program` with the invocation's arguments.
    ///
    /// Stderr is drained in the background into a `StderrTail`. A stdin
    /// payload is written concurrently with stdout being read.
    pub fn spawn(program: &Path, invocation: Invocation) -> Result<Self, ArchiveError> {
        let command = invocation.subcommand().to_string();

        let mut child = Command::new(program)
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ArchiveError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        debug!(
            "Spawned {} {} (pid {:?})",
            program.display(),
            invocation.args.join(" "),
            child.id()
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout of child process not captured"))?;
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(collect_stderr(pipe)));
        let stdin = match (child.stdin.take(), invocation.stdin) {
            (Some(mut pipe), Some(payload)) => Some(tokio::spawn(async move {
                // the exit status decides the outcome, not a broken pipe
                if let Err(e) = pipe.write_all(&payload).await {
                    debug!("Failed to write child stdin: {}", e);
                }
                drop(pipe);
            })),
            _ => None,
        };

        Ok(Self {
            command,
            child,
            stdout,
            stderr,
            stdin,
        })
    }

    /// Read the next stdout chunk, `None` at end of output
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ArchiveError> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let n = self.stdout.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        trace!("Read {} bytes from evr {}", n, self.command);
        Ok(Some(buf.freeze()))
    }

    /// Wait for the process to exit and map its status
    async fn finish(mut self) -> Result<(), ArchiveError> {
        let status = self.child.wait().await?;

        if let Some(stdin) = self.stdin.take() {
            let _ = stdin.await;
        }
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => StderrTail::default(),
        };

        if status.success() {
            debug!("evr {} finished", self.command);
            return Ok(());
        }

        Err(ChildProcessFailure {
            command: self.command.clone(),
            exit_code: exit_code(status),
            stderr: stderr.to_string_lossy(),
        }
        .into())
    }

    /// Stdout as a chunk stream which ends with the process's exit status
    pub fn into_stream(self) -> ChunkStream {
        stream::try_unfold(self, |mut process| async move {
            match process.next_chunk().await? {
                Some(chunk) => Ok(Some((chunk, process))),
                None => {
                    process.finish().await?;
                    Ok::<_, ArchiveError>(None)
                }
            }
        })
        .boxed()
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        // the child itself is killed by kill_on_drop
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
        if let Some(handle) = self.stdin.take() {
            handle.abort();
        }
    }
}

async fn collect_stderr(mut pipe: ChildStderr) -> StderrTail {
    let mut tail = StderrTail::default();
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buf.reserve(READ_CHUNK_SIZE);
        match pipe.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => tail.push(buf.split().freeze()),
        }
    }
    tail
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
