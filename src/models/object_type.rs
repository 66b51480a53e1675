//! The kinds of objects kept in an account's bucket.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A category of stored object.
///
/// Each kind lives under its own folder (`group`) below the account's root
/// folder and is written with a default filename unless the caller supplies
/// one. Canary configs are the only kind mirrored into the summary index.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    CanaryConfig,
    CanaryResultArchive,
    MetricSetList,
    MetricSetPairList,
}

impl ObjectType {
    pub const ALL: [ObjectType; 4] = [
        ObjectType::CanaryConfig,
        ObjectType::CanaryResultArchive,
        ObjectType::MetricSetList,
        ObjectType::MetricSetPairList,
    ];

    /// Folder segment used for every object of this kind.
    pub fn group(&self) -> &'static str {
        match self {
            ObjectType::CanaryConfig => "canary_config",
            ObjectType::CanaryResultArchive => "canary_archive",
            ObjectType::MetricSetList => "metrics",
            ObjectType::MetricSetPairList => "metric_pairs",
        }
    }

    /// Filename used when the caller does not name one.
    pub fn default_filename(&self) -> &'static str {
        match self {
            ObjectType::CanaryConfig => "canary_config.json",
            ObjectType::CanaryResultArchive => "canary_archive.json",
            ObjectType::MetricSetList => "metric_sets.json",
            ObjectType::MetricSetPairList => "metric_set_pairs.json",
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            ObjectType::CanaryConfig => "CANARY_CONFIG",
            ObjectType::CanaryResultArchive => "CANARY_RESULT_ARCHIVE",
            ObjectType::MetricSetList => "METRIC_SET_LIST",
            ObjectType::MetricSetPairList => "METRIC_SET_PAIR_LIST",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.variant_name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown object type `{0}`")]
pub struct UnknownObjectType(pub String);

impl FromStr for ObjectType {
    type Err = UnknownObjectType;

    /// Accepts either the folder group (`canary_config`) or the variant name
    /// (`CANARY_CONFIG`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.group().eq_ignore_ascii_case(s) || t.variant_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownObjectType(s.to_string()))
    }
}
