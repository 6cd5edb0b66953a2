//! Stream aggregation

use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};

/// Collect a chunk stream into one buffer once it completes.
///
/// The first error ends the collection. Memory use is bounded only by what
/// the upstream emits.
pub async fn collect_chunks<S, E>(chunks: S) -> Result<Bytes, E>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    let buf = chunks
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}
