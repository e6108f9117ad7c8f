use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// File extension of persisted generator weights.
pub const WEIGHTS_EXTENSION: &str = "safetensors";

/// The fixed set of generator variants shipped as weight files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "CycleGAN")]
    CycleGan,
    #[serde(rename = "DiscoGAN")]
    DiscoGan,
    #[serde(rename = "ToDayGAN")]
    ToDayGan,
    #[serde(rename = "UNITGAN")]
    UnitGan,
    #[serde(rename = "DualGAN")]
    DualGan,
    #[serde(rename = "SegmentGAN")]
    SegmentGan,
}

impl ModelId {
    pub const ALL: [ModelId; 6] = [
        ModelId::CycleGan,
        ModelId::DiscoGan,
        ModelId::ToDayGan,
        ModelId::UnitGan,
        ModelId::DualGan,
        ModelId::SegmentGan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CycleGan => "CycleGAN",
            Self::DiscoGan => "DiscoGAN",
            Self::ToDayGan => "ToDayGAN",
            Self::UnitGan => "UNITGAN",
            Self::DualGan => "DualGAN",
            Self::SegmentGan => "SegmentGAN",
        }
    }

    /// `<identifier>.safetensors`
    pub fn weights_file_name(&self) -> String {
        format!("{}.{WEIGHTS_EXTENSION}", self.as_str())
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = Error;

    /// Case-insensitive match against the canonical spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ModelId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| Error::UnknownModel(trimmed.to_string()))
    }
}
