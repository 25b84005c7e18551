use serde::{Deserialize, Serialize};

/// `GET /v1/models` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    pub fn from_model_ids<I, S>(ids: I, created: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            object: "list".to_string(),
            data: ids
                .into_iter()
                .map(|id| Model {
                    id: id.into(),
                    object: "model".to_string(),
                    created,
                    owned_by: "google".to_string(),
                })
                .collect(),
        }
    }
}
