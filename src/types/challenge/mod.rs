use chrono::prelude::*;

/// Challenge object as embedded in an authorization or returned on its own.
#[derive(Serialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub challenge_type: Type,
    pub url: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<super::error::Error>,
    pub token: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Type {
    #[serde(rename = "http-01")]
    HTTP01,
    #[serde(rename = "dns-01")]
    DNS01,
    #[serde(rename = "tls-alpn-01")]
    TLSALPN01,
}

impl Type {
    /// Offered for non-wildcard identifiers, in this order.
    pub const ALL: [Type; 3] = [Type::HTTP01, Type::TLSALPN01, Type::DNS01];

    pub fn as_str(&self) -> &'static str {
        match self {
            Type::HTTP01 => "http-01",
            Type::DNS01 => "dns-01",
            Type::TLSALPN01 => "tls-alpn-01",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Processing,
    Valid,
    Invalid,
}
