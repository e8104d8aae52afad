use serde::{Deserialize, Serialize};

/// Service-specific pipe parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,
}

/// Body returned by a service after creating or updating a time entry.
#[derive(Debug, Deserialize)]
pub struct ExportResponse {
    pub id: i64,
}
