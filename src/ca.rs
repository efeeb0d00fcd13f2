//! Client side of the signing authority that issues and revokes certificates.

use base64::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaError {
    #[error("signing authority rejected the request: {0}")]
    Rejected(String),
    #[error("signing authority unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevokeError {
    #[error("certificate already revoked")]
    AlreadyRevoked,
    #[error("certificate unknown to the signing authority")]
    UnknownCertificate,
    #[error("signing authority rejected the revocation: {0}")]
    Rejected(String),
    #[error("signing authority unavailable: {0}")]
    Unavailable(String),
}

/// RFC 5280 CRLReason values accepted from ACME clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlReason {
    Unspecified,
    KeyCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    PrivilegeWithdrawn,
}

impl CrlReason {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unspecified),
            1 => Some(Self::KeyCompromise),
            3 => Some(Self::AffiliationChanged),
            4 => Some(Self::Superseded),
            5 => Some(Self::CessationOfOperation),
            6 => Some(Self::CertificateHold),
            9 => Some(Self::PrivilegeWithdrawn),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::PrivilegeWithdrawn => 9,
        }
    }
}

#[async_trait::async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Submits a DER CSR and returns the issued DER certificate.
    async fn issue_certificate(
        &self, ca: &str, profile: &str, csr: &[u8],
        not_before: Option<chrono::DateTime<chrono::Utc>>,
        not_after: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<u8>, CaError>;

    async fn revoke_certificate(&self, ca: &str, serial_hex: &str, reason: CrlReason) -> Result<(), RevokeError>;

    /// DER certificates of the issuing CA, leaf-most first.
    async fn issuer_chain(&self, ca: &str) -> Result<Vec<Vec<u8>>, CaError>;
}

#[derive(Serialize)]
struct EnrollRequest<'a> {
    profile: &'a str,
    csr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    not_before: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    not_after: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize)]
struct EnrollResponse {
    certificate: String,
}

#[derive(Serialize)]
struct RevokeRequest<'a> {
    serial: &'a str,
    reason: u8,
}

#[derive(Deserialize)]
struct CaCertsResponse {
    certificates: Vec<String>,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Talks JSON to a signing authority service, binary fields base64url encoded.
pub struct RestSigningAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl RestSigningAuthority {
    pub fn new(config: &crate::config::SigningAuthorityConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("acme-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, ca: &str, op: &str) -> String {
        format!("{}/{}/{}", self.base_url, ca, op)
    }
}

fn transport_error(err: reqwest::Error) -> CaError {
    CaError::Unavailable(err.to_string())
}

async fn error_body(resp: reqwest::Response) -> ErrorResponse {
    resp.json::<ErrorResponse>().await.unwrap_or_default()
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, CaError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = error_body(resp).await;
    let detail = body.detail.or(body.error).unwrap_or_else(|| status.to_string());
    if status.is_client_error() {
        Err(CaError::Rejected(detail))
    } else {
        Err(CaError::Unavailable(detail))
    }
}

fn decode_der(value: &str) -> Result<Vec<u8>, CaError> {
    BASE64_URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))
        .map_err(|e| CaError::Unavailable(format!("invalid base64 from signing authority: {}", e)))
}

#[async_trait::async_trait]
impl SigningAuthority for RestSigningAuthority {
    async fn issue_certificate(
        &self, ca: &str, profile: &str, csr: &[u8],
        not_before: Option<chrono::DateTime<chrono::Utc>>,
        not_after: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<u8>, CaError> {
        let req = EnrollRequest {
            profile,
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr),
            not_before,
            not_after,
        };
        let resp = self.client.post(self.endpoint(ca, "enroll"))
            .json(&req)
            .send().await.map_err(transport_error)?;
        let resp: EnrollResponse = check_status(resp).await?
            .json().await.map_err(transport_error)?;
        decode_der(&resp.certificate)
    }

    async fn revoke_certificate(&self, ca: &str, serial_hex: &str, reason: CrlReason) -> Result<(), RevokeError> {
        let req = RevokeRequest {
            serial: serial_hex,
            reason: reason.code(),
        };
        let resp = self.client.post(self.endpoint(ca, "revoke"))
            .json(&req)
            .send().await.map_err(|e| RevokeError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = error_body(resp).await;
        match body.error.as_deref() {
            Some("alreadyRevoked") => Err(RevokeError::AlreadyRevoked),
            Some("unknownCertificate") => Err(RevokeError::UnknownCertificate),
            _ => {
                let detail = body.detail.or(body.error).unwrap_or_else(|| status.to_string());
                if status.is_client_error() {
                    Err(RevokeError::Rejected(detail))
                } else {
                    Err(RevokeError::Unavailable(detail))
                }
            }
        }
    }

    async fn issuer_chain(&self, ca: &str) -> Result<Vec<Vec<u8>>, CaError> {
        let resp = self.client.get(self.endpoint(ca, "cacerts"))
            .send().await.map_err(transport_error)?;
        let resp: CaCertsResponse = check_status(resp).await?
            .json().await.map_err(transport_error)?;
        resp.certificates.iter().map(|c| decode_der(c)).collect()
    }
}
