use chrono::prelude::*;

#[derive(Serialize)]
pub struct List {
    pub orders: Vec<String>,
}

/// Order object as returned to clients.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: Status,
    pub expires: DateTime<Utc>,
    pub identifiers: Vec<super::identifier::Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<super::error::Error>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Ready => "ready",
            Status::Processing => "processing",
            Status::Valid => "valid",
            Status::Invalid => "invalid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        [Status::Pending, Status::Ready, Status::Processing, Status::Valid, Status::Invalid]
            .into_iter()
            .find(|status| status.as_str() == s)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreate {
    pub identifiers: Vec<super::identifier::Identifier>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct OrderFinalize {
    pub csr: String,
}
