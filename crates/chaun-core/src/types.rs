//! Common types used throughout Chaun

use serde::{Deserialize, Serialize};
use url::Url;

/// Character animation files shipped with the current client build.
const DEFAULT_ASSETS: &[&str] = &[
    "https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5standingPants.glb",
    "https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5dancingPants.glb",
    "https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5dancing.glb",
    "https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5sitting.glb",
    "https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5entry.glb",
    "https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5entryPants.glb",
];

/// Ordered list of asset URLs fetched eagerly at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<Url>);

impl AssetManifest {
    pub fn new(urls: Vec<Url>) -> Self {
        Self(urls)
    }

    /// Build a manifest from string URLs, failing on the first bad entry.
    pub fn parse<'a>(urls: impl IntoIterator<Item = &'a str>) -> Result<Self, url::ParseError> {
        urls.into_iter()
            .map(Url::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn urls(&self) -> &[Url] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.0.contains(url)
    }
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self(
            DEFAULT_ASSETS
                .iter()
                .filter_map(|u| Url::parse(u).ok())
                .collect(),
        )
    }
}

/// How install reacts when some manifest entries cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Store every entry that could be fetched; log the rest.
    #[default]
    BestEffort,
    /// Store nothing unless every entry could be fetched.
    Atomic,
}
