use serde::{Deserialize, Serialize};

/// Header carrying the revision being built
pub const REVISION_HEADER: &str = "x-apigee-script-container-rev";

/// Response for a successful build and push
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BuildResponse {
    pub endpoint: String,
    /// Registry-qualified tag of the pushed image
    #[serde(rename = "containerId")]
    pub container_id: String,
}
