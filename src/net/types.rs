//! Wire DTOs for the console/backend boundary.
//!
//! DESIGN
//! ======
//! The backend owns these shapes. Only `id` is required on a user; every
//! other identity field is optional and unknown fields are carried through
//! in `extra` so a persisted profile never loses data the backend sent.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of the signed-in operator as returned by login/verification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Backend user identifier.
    pub id: String,
    /// Login email, if the backend returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Role within the tenant (e.g. `"admin"`, `"agent"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Company or workspace name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    /// Any additional fields the backend attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    /// Human-facing label: name, then email, then id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Body of a successful `POST /api/auth/verify-token`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct VerifyResponse {
    pub user: UserProfile,
}

/// Body of a successful login or registration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AuthResponse {
    pub user: UserProfile,
    pub token: String,
}

/// Payload for `POST /api/auth/login`.
#[derive(Clone, Debug, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Payload for `POST /api/auth/register`.
#[derive(Clone, Debug, Serialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}
