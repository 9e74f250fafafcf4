use serde::{Deserialize, Serialize};

/// A row of the `users` table. Provisioned out of band; read-only to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub linux_user: String,
    #[serde(default)]
    pub email: Option<String>,
}
