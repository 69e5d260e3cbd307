use serde::{Deserialize, Serialize};

use crate::auth::Credential;

/// HTTP listener and authentication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpConfig {
    /// `host:port` to bind.
    pub listen: String,
    /// Require credentials on read-only endpoints (all current routes).
    pub authenticate_readonly: bool,
    /// Require credentials on endpoints that change agent state.
    pub authenticate_readwrite: bool,
    pub credentials: Vec<Credential>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5051".to_string(),
            authenticate_readonly: false,
            authenticate_readwrite: false,
            credentials: Vec::new(),
        }
    }
}
