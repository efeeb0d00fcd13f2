use chrono::prelude::*;

/// Authorization object as returned to clients.
#[derive(Serialize)]
pub struct Authorization {
    pub identifier: super::identifier::Identifier,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    pub challenges: Vec<super::challenge::Challenge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<bool>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl Status {
    /// Whether no further transition is possible.
    pub fn is_final(&self) -> bool {
        !matches!(self, Status::Pending | Status::Valid)
    }
}

/// Client request to change an authorization; only deactivation is accepted.
#[derive(Debug, Deserialize)]
pub struct AuthorizationUpdate {
    #[serde(default)]
    pub status: Option<Status>,
}
