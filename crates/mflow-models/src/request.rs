//! Request and response bodies for the job HTTP surface.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::JobId;

/// Body of `POST /jobs`.
///
/// Fields are optional at the serde level so a missing field reaches
/// validation instead of failing JSON extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[validate(required(message = "mediaId is required"), length(min = 1, max = 256))]
    pub media_id: Option<String>,

    #[validate(required(message = "sourceUrl is required"), length(min = 1, max = 2048))]
    pub source_url: Option<String>,
}

/// Body of a successful `POST /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: JobId,
}
