//! Archive operations on top of the `evr` tool

use crate::{collect_chunks, ArchiveError, ChunkStream, CommandSpawner, Invocation, ProcessSpawner};
use bytes::{Bytes, BytesMut};
use evr_gateway_protocol::ModifiedClaimSet;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Claim sets reported by a running watch
pub type ModifiedClaimSetStream = BoxStream<'static, Result<ModifiedClaimSet, ArchiveError>>;

/// Flags passed to `evr sign-put`; bit 0 marks the blob as a claim set
const SIGN_PUT_FLAGS: u32 = 0x01;

/// Handle to the archive. Cheap to clone; every operation starts its own
/// `evr` process.
#[derive(Clone)]
pub struct Archive {
    spawner: Arc<dyn ProcessSpawner>,
}

impl Archive {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { spawner }
    }

    /// Archive backed by the `evr` executable at `program`
    pub fn evr(program: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(CommandSpawner::new(program)))
    }

    /// Watch for claim sets modified after `last_modified_after`.
    ///
    /// The stream lives as long as the `evr watch` process; dropping it
    /// kills the process.
    pub fn watch(
        &self,
        last_modified_after: u64,
        flags: Option<u32>,
    ) -> Result<ModifiedClaimSetStream, ArchiveError> {
        let mut args = vec![
            "watch".to_string(),
            format!("--last-modified-after={}", last_modified_after),
        ];
        if let Some(flags) = flags.filter(|flags| *flags != 0) {
            args.push(format!("--flags={}", flags));
        }

        let chunks = self.spawner.spawn(Invocation::new(args))?;
        Ok(lines(chunks)
            .try_filter_map(|line| async move { Ok(parse_watch_line(&line)) })
            .boxed())
    }

    /// Fetch a blob and verify its signature. Yields the whole blob once
    /// `evr` exits successfully.
    pub async fn get_and_verify(&self, reference: &str) -> Result<Bytes, ArchiveError> {
        let chunks = self
            .spawner
            .spawn(Invocation::new(["get-verify", reference]))?;
        collect_chunks(chunks).await
    }

    /// Sign a claim set and store it, returning the new blob's reference
    pub async fn sign_and_put(&self, claim_set: impl Into<Bytes>) -> Result<String, ArchiveError> {
        let invocation = Invocation::new(["sign-put".to_string(), format!("--flags={}", SIGN_PUT_FLAGS)])
            .with_stdin(claim_set);
        let chunks = self.spawner.spawn(invocation)?;
        let stdout = collect_chunks(chunks).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

/// Parse one `evr watch` output line: `<ref> <last-modified> <flags>`.
///
/// Blank lines yield `None`; malformed lines are logged and yield `None`.
pub fn parse_watch_line(line: &str) -> Option<ModifiedClaimSet> {
    let mut fields = line.split_whitespace();
    let reference = fields.next()?;
    match fields.next().map(str::parse::<u64>) {
        Some(Ok(last_modified)) => Some(ModifiedClaimSet::new(reference, last_modified)),
        _ => {
            warn!("Ignoring malformed watch line: {:?}", line);
            None
        }
    }
}

struct LineSplitter {
    chunks: ChunkStream,
    pending: BytesMut,
    exhausted: bool,
}

/// Split a chunk stream into lines. A final line without a newline is
/// emitted once the stream ends.
fn lines(chunks: ChunkStream) -> BoxStream<'static, Result<String, ArchiveError>> {
    let splitter = LineSplitter {
        chunks,
        pending: BytesMut::new(),
        exhausted: false,
    };

    stream::try_unfold(splitter, |mut splitter| async move {
        loop {
            if let Some(newline) = splitter.pending.iter().position(|b| *b == b'\n') {
                let line = splitter.pending.split_to(newline + 1);
                return Ok(Some((decode_line(&line), splitter)));
            }
            if splitter.exhausted {
                if splitter.pending.is_empty() {
                    return Ok::<_, ArchiveError>(None);
                }
                let line = splitter.pending.split();
                return Ok(Some((decode_line(&line), splitter)));
            }
            match splitter.chunks.next().await {
                Some(chunk) => splitter.pending.extend_from_slice(&chunk?),
                None => splitter.exhausted = true,
            }
        }
    })
    .boxed()
}

fn decode_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedSpawner};

    fn archive(spawner: &Arc<ScriptedSpawner>) -> Archive {
        Archive::new(spawner.clone())
    }

    #[test]
    fn test_parse_watch_line() {
        assert_eq!(
            parse_watch_line("abc123 42 x"),
            Some(ModifiedClaimSet::new("abc123", 42))
        );
        assert_eq!(parse_watch_line(""), None);
        assert_eq!(parse_watch_line("abc123"), None);
        assert_eq!(parse_watch_line("abc123 soon 01"), None);
    }

    #[tokio::test]
    async fn test_watch_arguments() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.script("watch", Script::output(""));

        let archive = archive(&spawner);
        archive.watch(0, None).unwrap().try_collect::<Vec<_>>().await.unwrap();
        archive.watch(17, Some(0)).unwrap().try_collect::<Vec<_>>().await.unwrap();
        archive.watch(17, Some(3)).unwrap().try_collect::<Vec<_>>().await.unwrap();

        let args: Vec<Vec<String>> = spawner.invocations().into_iter().map(|i| i.args).collect();
        assert_eq!(
            args,
            vec![
                vec!["watch", "--last-modified-after=0"],
                vec!["watch", "--last-modified-after=17"],
                vec!["watch", "--last-modified-after=17", "--flags=3"],
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_splits_lines_across_chunks() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.script(
            "watch",
            Script::output("abc123 42 x\nde")
                .chunk("f456 43 01\n\n")
                .chunk("0a0b 44 01"),
        );

        let claim_sets: Vec<_> = archive(&spawner)
            .watch(0, None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            claim_sets,
            vec![
                ModifiedClaimSet::new("abc123", 42),
                ModifiedClaimSet::new("def456", 43),
                ModifiedClaimSet::new("0a0b", 44),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_failure_after_output() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.script("watch", Script::output("abc123 42 x\n").then_exit(1));

        let mut watch = archive(&spawner).watch(0, None).unwrap();
        assert_eq!(
            watch.next().await.unwrap().unwrap(),
            ModifiedClaimSet::new("abc123", 42)
        );
        let err = watch.next().await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), 1);
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_get_and_verify_aggregates_output() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.script("get-verify abc", Script::output("<claim-set ").chunk("/>"));

        let content = archive(&spawner).get_and_verify("abc").await.unwrap();
        assert_eq!(&content[..], b"<claim-set />");
    }

    #[tokio::test]
    async fn test_get_and_verify_exit_code() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.script("get-verify abc", Script::exit(5));

        match archive(&spawner).get_and_verify("abc").await {
            Err(ArchiveError::ChildProcess(failure)) => {
                assert_eq!(failure.exit_code, 5);
                assert!(failure.is_expected());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sign_and_put_writes_stdin_and_trims() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.script("sign-put", Script::output("  sha3-224-feed\n"));

        let reference = archive(&spawner)
            .sign_and_put("<claim-set/>".to_string())
            .await
            .unwrap();
        assert_eq!(reference, "sha3-224-feed");

        let invocations = spawner.invocations();
        assert_eq!(invocations[0].args, vec!["sign-put", "--flags=1"]);
        assert_eq!(
            invocations[0].stdin.as_deref(),
            Some(&b"<claim-set/>"[..])
        );
    }

    #[tokio::test]
    async fn test_dropping_watch_stops_process() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.script("watch", Script::output("abc123 42 x\n").then_hang());

        let mut watch = archive(&spawner).watch(0, None).unwrap();
        watch.next().await.unwrap().unwrap();
        assert_eq!(spawner.running(), 1);

        drop(watch);
        assert_eq!(spawner.running(), 0);
    }
}
