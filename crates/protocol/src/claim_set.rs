//! Claim set change notifications

use serde::{Deserialize, Serialize};

/// A claim set reported as modified by the archive's watch stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModifiedClaimSet {
    /// Content reference of the claim set
    #[serde(rename = "ref")]
    pub reference: String,

    /// Modification marker, ordered within the archive's change log
    #[serde(rename = "lastModified")]
    pub last_modified: u64,
}

impl ModifiedClaimSet {
    pub fn new(reference: impl Into<String>, last_modified: u64) -> Self {
        Self {
            reference: reference.into(),
            last_modified,
        }
    }
}
