//! Scripted process spawner for tests
//!
//! Replaces `evr` with canned stdout chunks and exit outcomes, records every
//! invocation and counts the streams that are still alive so tests can
//! observe that no process outlives its consumer.

use crate::{ArchiveError, ChildProcessFailure, ChunkStream, Invocation, ProcessSpawner};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a scripted process ends after emitting its chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exit(i32),
    Hang,
}

/// Canned behaviour of one invocation
#[derive(Debug, Clone)]
pub struct Script {
    chunks: Vec<Bytes>,
    outcome: Outcome,
}

impl Script {
    /// Emit `chunk` and exit with code 0
    pub fn output(chunk: impl Into<Bytes>) -> Self {
        Self {
            chunks: vec![chunk.into()],
            outcome: Outcome::Exit(0),
        }
    }

    /// Exit with `code` without any output
    pub fn exit(code: i32) -> Self {
        Self {
            chunks: Vec::new(),
            outcome: Outcome::Exit(code),
        }
    }

    pub fn chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    pub fn then_exit(mut self, code: i32) -> Self {
        self.outcome = Outcome::Exit(code);
        self
    }

    /// Keep running after the output until the stream is dropped
    pub fn then_hang(mut self) -> Self {
        self.outcome = Outcome::Hang;
        self
    }
}

/// `ProcessSpawner` that plays back scripts.
///
/// Scripts are looked up by the full argument list joined with spaces,
/// then by subcommand alone.
#[derive(Default)]
pub struct ScriptedSpawner {
    scripts: Mutex<HashMap<String, Script>>,
    invocations: Mutex<Vec<Invocation>>,
    running: Arc<AtomicUsize>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, key: impl Into<String>, script: Script) {
        lock(&self.scripts).insert(key.into(), script);
    }

    /// Every invocation so far, in spawn order
    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Number of spawned streams not yet dropped
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait until all spawned streams are dropped
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.running() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, invocation: Invocation) -> Result<ChunkStream, ArchiveError> {
        lock(&self.invocations).push(invocation.clone());

        let script = {
            let scripts = lock(&self.scripts);
            scripts
                .get(&invocation.args.join(" "))
                .or_else(|| scripts.get(invocation.subcommand()))
                .cloned()
        };
        let Some(script) = script else {
            return Err(ArchiveError::Spawn {
                program: "evr".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no script"),
            });
        };

        let command = invocation.subcommand().to_string();
        let ending: ChunkStream = match script.outcome {
            Outcome::Exit(0) => stream::empty().boxed(),
            Outcome::Exit(exit_code) => stream::once(async move {
                Err(ArchiveError::from(ChildProcessFailure {
                    command,
                    exit_code,
                    stderr: "scripted failure".to_string(),
                }))
            })
            .boxed(),
            Outcome::Hang => stream::pending().boxed(),
        };

        let guard = RunningGuard::new(self.running.clone());
        Ok(stream::iter(script.chunks.into_iter().map(Ok))
            .chain(ending)
            .map(move |chunk| {
                let _alive = &guard;
                chunk
            })
            .boxed())
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn new(running: Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self(running)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
