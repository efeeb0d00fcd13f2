#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Error {
    #[serde(rename = "type")]
    pub error_type: Type,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(rename = "subproblems", default, skip_serializing_if = "Vec::is_empty")]
    pub sub_problems: Vec<Error>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<super::identifier::Identifier>
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({}): {}", self.error_type, self.status, self.detail)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    #[serde(rename = "urn:ietf:params:acme:error:accountDoesNotExist")]
    AccountDoesNotExist,
    #[serde(rename = "urn:ietf:params:acme:error:alreadyRevoked")]
    AlreadyRevoked,
    #[serde(rename = "urn:ietf:params:acme:error:badCSR")]
    BadCSR,
    #[serde(rename = "urn:ietf:params:acme:error:badNonce")]
    BadNonce,
    #[serde(rename = "urn:ietf:params:acme:error:badPublicKey")]
    BadPublicKey,
    #[serde(rename = "urn:ietf:params:acme:error:badRevocationReason")]
    BadRevocationReason,
    #[serde(rename = "urn:ietf:params:acme:error:badSignatureAlgorithm")]
    BadSignatureAlgorithm,
    #[serde(rename = "urn:ietf:params:acme:error:connection")]
    Connection,
    #[serde(rename = "urn:ietf:params:acme:error:dns")]
    DNS,
    #[serde(rename = "urn:ietf:params:acme:error:incorrectResponse")]
    IncorrectResponse,
    #[serde(rename = "urn:ietf:params:acme:error:invalidContact")]
    InvalidContact,
    #[serde(rename = "urn:ietf:params:acme:error:malformed")]
    Malformed,
    #[serde(rename = "urn:ietf:params:acme:error:orderNotReady")]
    OrderNotReady,
    #[serde(rename = "urn:ietf:params:acme:error:rejectedIdentifier")]
    RejectedIdentifier,
    #[serde(rename = "urn:ietf:params:acme:error:serverInternal")]
    ServerInternal,
    #[serde(rename = "urn:ietf:params:acme:error:tls")]
    TLS,
    #[serde(rename = "urn:ietf:params:acme:error:unauthorized")]
    Unauthorized,
    #[serde(rename = "urn:ietf:params:acme:error:unsupportedContact")]
    UnsupportedContact,
    #[serde(rename = "urn:ietf:params:acme:error:unsupportedIdentifier")]
    UnsupportedIdentifier,
    #[serde(rename = "urn:ietf:params:acme:error:userActionRequired")]
    UserActionRequired,
}

/// Builds a problem document: `problem!(Type, status, title, detail)`.
#[macro_export]
macro_rules! problem {
    ($error_type:ident, $status:expr, $title:expr, $detail:expr) => {
        crate::types::error::Error {
            error_type: crate::types::error::Type::$error_type,
            status: $status,
            title: ($title).to_string(),
            detail: ($detail).to_string(),
            sub_problems: vec![],
            instance: None,
            identifier: None,
        }
    }
}

#[macro_export]
macro_rules! internal_server_error {
    () => {
        crate::types::error::Error {
            error_type: crate::types::error::Type::ServerInternal,
            status: 500,
            title: String::from("Internal Server Error"),
            detail: "Something really went wrong there, we have no idea what it was".to_string(),
            sub_problems: vec![],
            instance: None,
            identifier: None,
        }
    }
}
