use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Response of the upstream models endpoint: a map of model id to metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamModelList {
    #[serde(default)]
    pub models: BTreeMap<String, Value>,
}

impl UpstreamModelList {
    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}
