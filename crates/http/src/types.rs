//! Request and response types for the backend API

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Application user as known to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl BackendUser {
    /// Full name, falling back to the username
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

/// Extended profile attached to a user
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub preferred_language: Option<String>,
    /// Fields this client does not interpret
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Access/refresh pair returned by login and refresh endpoints
///
/// `refresh` is absent when the backend keeps it in an HttpOnly cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Login response, optionally carrying the user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    #[serde(default)]
    pub user: Option<BackendUser>,
}

/// Exchange of identity-provider tokens for a backend session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureTokenExchange {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

/// Username/password login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsLogin {
    pub username: String,
    pub password: String,
}

/// Body of the refresh request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// Backend health response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    /// Whether the backend reports itself usable
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.to_ascii_lowercase().as_str(), "ok" | "healthy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn login_response_without_refresh_or_user() {
        let parsed: LoginResponse = serde_json::from_value(json!({ "access": "a1" })).unwrap();
        assert_eq!(parsed.tokens.access, "a1");
        assert!(parsed.tokens.refresh.is_none());
        assert!(parsed.user.is_none());
    }

    #[test]
    fn profile_keeps_unknown_fields() {
        let parsed: UserProfile =
            serde_json::from_value(json!({ "department": "Research", "theme": "dark" })).unwrap();
        assert_eq!(parsed.department.as_deref(), Some("Research"));
        assert_eq!(parsed.extra.get("theme"), Some(&json!("dark")));
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let user = BackendUser {
            id: 1,
            username: "mvirtanen".into(),
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            role: None,
            is_staff: false,
            is_superuser: false,
            groups: Vec::new(),
        };
        assert_eq!(user.display_name(), "mvirtanen");
    }
}
