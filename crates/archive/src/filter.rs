//! Claim set filter for watch streams

use crate::{Archive, ArchiveError, ModifiedClaimSetStream};
use evr_gateway_protocol::FilterSpec;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Unknown filter type {0:?}")]
    UnknownType(Option<String>),

    #[error("namespace filter requires ns property with namespace")]
    MissingNamespace,
}

/// Transform applied to the claim sets of one watch subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimSetFilter {
    PassThrough,

    /// Forward only claim sets whose content mentions the namespace
    Namespace(String),
}

impl ClaimSetFilter {
    /// Build a filter from the watch command's optional descriptor
    pub fn from_spec(spec: Option<&FilterSpec>) -> Result<Self, FilterError> {
        let Some(spec) = spec else {
            return Ok(Self::PassThrough);
        };
        if spec.kind.as_deref() != Some("namespace") {
            return Err(FilterError::UnknownType(spec.kind.clone()));
        }
        match spec.ns.as_deref() {
            Some(ns) if !ns.is_empty() => Ok(Self::Namespace(ns.to_string())),
            _ => Err(FilterError::MissingNamespace),
        }
    }

    /// Apply the filter to a watch stream.
    ///
    /// The namespace filter fetches every claim set with `get_and_verify`,
    /// one at a time and in order. A failed fetch ends the stream with that
    /// error.
    pub fn apply(self, archive: Archive, claim_sets: ModifiedClaimSetStream) -> ModifiedClaimSetStream {
        let ns = match self {
            Self::PassThrough => return claim_sets,
            Self::Namespace(ns) => ns,
        };

        stream::try_unfold(
            (claim_sets, archive, ns),
            |(mut claim_sets, archive, ns)| async move {
                while let Some(claim_set) = claim_sets.try_next().await? {
                    let content = archive.get_and_verify(&claim_set.reference).await?;
                    if contains(&content, ns.as_bytes()) {
                        return Ok(Some((claim_set, (claim_sets, archive, ns))));
                    }
                    trace!("Claim set {} does not mention {}", claim_set.reference, ns);
                }
                Ok::<_, ArchiveError>(None)
            },
        )
        .boxed()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
