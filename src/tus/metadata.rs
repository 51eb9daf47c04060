use std::collections::{BTreeMap, HashMap};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// tus `Upload-Metadata` 头
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pairs: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &HashMap<String, String>) -> Self {
        Self {
            pairs: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// `key base64(value)` 以逗号分隔
    pub fn to_header(&self) -> String {
        self.pairs
            .iter()
            .map(|(key, value)| format!("{} {}", key, STANDARD.encode(value)))
            .collect::<Vec<_>>()
            .join(",")
    }
}
