use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FileCreated {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileQuery {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FileListEntry {
    pub id: String,
    pub path: String,
}
