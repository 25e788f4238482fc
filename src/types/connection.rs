use serde::{Deserialize, Serialize};

/// A user's linked mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub email: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_provider() -> String {
    "google".to_string()
}

fn default_true() -> bool {
    true
}

impl Connection {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            email: email.into(),
            provider: default_provider(),
            is_active: true,
        }
    }
}
