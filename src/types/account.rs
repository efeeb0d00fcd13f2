/// Account object as returned to clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub status: Status,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_binding: Option<serde_json::Value>,
    pub orders: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreate {
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    #[serde(default)]
    pub external_account_binding: Option<serde_json::Value>,
    #[serde(default)]
    pub only_return_existing: bool,
}

#[derive(Debug, Deserialize)]
pub struct AccountUpdate {
    #[serde(default)]
    pub contact: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<Status>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Valid,
    Deactivated,
    Revoked,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Valid => "valid",
            Status::Deactivated => "deactivated",
            Status::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        [Status::Valid, Status::Deactivated, Status::Revoked].into_iter().find(|status| status.as_str() == s)
    }
}

/// Inner payload of a key rollover.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChange {
    pub account: String,
    pub old_key: super::jose::JWK,
}

#[derive(Debug, Deserialize)]
pub struct Revocation {
    pub certificate: String,
    /// CRLReason code, absent meaning unspecified.
    #[serde(default)]
    pub reason: Option<u8>,
}
