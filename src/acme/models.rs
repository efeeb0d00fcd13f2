use std::collections::BTreeMap;
use chrono::prelude::*;
use crate::types;

pub fn account_url(base_url: &str, id: u64) -> String {
    format!("{}acct/{}", base_url, crate::util::id_to_b64(id))
}

pub fn account_orders_url(base_url: &str, id: u64) -> String {
    format!("{}orders/{}", base_url, crate::util::id_to_b64(id))
}

pub fn order_url(base_url: &str, id: u64) -> String {
    format!("{}order/{}", base_url, crate::util::id_to_b64(id))
}

pub fn finalize_url(base_url: &str, id: u64) -> String {
    format!("{}finalize/{}", base_url, crate::util::id_to_b64(id))
}

pub fn certificate_url(base_url: &str, id: u64) -> String {
    format!("{}cert/{}", base_url, crate::util::id_to_b64(id))
}

pub fn authorization_url(base_url: &str, id: u64) -> String {
    format!("{}authz/{}", base_url, crate::util::id_to_b64(id))
}

pub fn challenge_url(base_url: &str, id: ChallengeId) -> String {
    format!(
        "{}chall/{}/{}", base_url,
        crate::util::id_to_b64(id.authz_id), crate::util::sub_id_to_b64(id.sub_id)
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: u64,
    pub status: types::account::Status,
    /// Canonical JWK members, see [`types::jose::JWK::canonical`].
    pub jwk: BTreeMap<String, String>,
    pub contacts: Vec<String>,
    pub eab: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn thumbprint(&self) -> String {
        types::jose::thumbprint(&self.jwk)
    }

    pub fn public_key(&self) -> Result<openssl::pkey::PKey<openssl::pkey::Public>, String> {
        let jwk = types::jose::JWK::from_canonical(&self.jwk)?;
        std::convert::TryFrom::try_from(&jwk)
    }

    pub fn to_json(&self, base_url: &str) -> types::account::Account {
        types::account::Account {
            status: self.status,
            contact: self.contacts.clone(),
            terms_of_service_agreed: true,
            external_account_binding: self.eab.clone(),
            orders: account_orders_url(base_url, self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChallengeId {
    pub authz_id: u64,
    pub sub_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub sub_id: u32,
    #[serde(rename = "type")]
    pub challenge_type: types::challenge::Type,
    pub token: String,
    pub expected_authorization: String,
    pub status: types::challenge::Status,
    #[serde(default)]
    pub validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<types::error::Error>,
}

impl Challenge {
    /// The key authorization is `token.thumbprint`; dns-01 and tls-alpn-01 expect its SHA-256 digest.
    pub fn new(
        sub_id: u32, challenge_type: types::challenge::Type, token: String, thumbprint: &str,
    ) -> Result<Self, openssl::error::ErrorStack> {
        let key_auth = format!("{}.{}", token, thumbprint);
        let expected_authorization = match challenge_type {
            types::challenge::Type::HTTP01 => key_auth,
            types::challenge::Type::DNS01 | types::challenge::Type::TLSALPN01 =>
                crate::util::sha256_b64(key_auth.as_bytes())?,
        };
        Ok(Challenge {
            sub_id,
            challenge_type,
            token,
            expected_authorization,
            status: types::challenge::Status::Pending,
            validated: None,
            error: None,
        })
    }

    pub fn to_json(&self, base_url: &str, authz_id: u64) -> types::challenge::Challenge {
        types::challenge::Challenge {
            challenge_type: self.challenge_type,
            url: challenge_url(base_url, ChallengeId { authz_id, sub_id: self.sub_id }),
            status: self.status,
            validated: self.validated,
            error: self.error.clone(),
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub id: u64,
    pub identifier: types::identifier::Identifier,
    pub status: types::authorization::Status,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    pub fn challenge(&self, sub_id: u32) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.sub_id == sub_id)
    }

    pub fn challenge_mut(&mut self, sub_id: u32) -> Option<&mut Challenge> {
        self.challenges.iter_mut().find(|c| c.sub_id == sub_id)
    }

    /// Moves a pending authorization past its expiry to `expired`.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        if self.status == types::authorization::Status::Pending && self.expires <= now {
            self.status = types::authorization::Status::Expired;
        }
    }

    pub fn to_json(&self, base_url: &str) -> types::authorization::Authorization {
        let wildcard = self.identifier.is_wildcard();
        types::authorization::Authorization {
            identifier: types::identifier::Identifier {
                id_type: self.identifier.id_type.clone(),
                value: self.identifier.base_domain().to_string(),
            },
            status: self.status,
            expires: Some(self.expires),
            challenges: self.challenges.iter().map(|c| c.to_json(base_url, self.id)).collect(),
            wildcard: if wildcard { Some(true) } else { None },
        }
    }
}

/// Certificate request parameters held with an order until enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertReqMeta {
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: u64,
    pub account_id: u64,
    pub status: types::order::Status,
    pub expires: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub authorizations: Vec<Authorization>,
    pub cert_req_meta: Option<CertReqMeta>,
    pub csr: Option<Vec<u8>>,
    pub certificate: Option<Vec<u8>>,
    pub cert_not_after: Option<DateTime<Utc>>,
    pub error: Option<types::error::Error>,
}

impl Order {
    pub fn identifiers(&self) -> Vec<types::identifier::Identifier> {
        self.authorizations.iter().map(|a| a.identifier.clone()).collect()
    }

    pub fn authorization(&self, id: u64) -> Option<&Authorization> {
        self.authorizations.iter().find(|a| a.id == id)
    }

    pub fn authorization_mut(&mut self, id: u64) -> Option<&mut Authorization> {
        self.authorizations.iter_mut().find(|a| a.id == id)
    }

    /// True while a pending authorization has a challenge awaiting the validator.
    pub fn needs_validation(&self) -> bool {
        self.authorizations.iter().any(|a| {
            a.status == types::authorization::Status::Pending &&
                a.challenges.iter().any(|c| c.status == types::challenge::Status::Processing)
        })
    }

    pub fn needs_enrollment(&self) -> bool {
        self.status == types::order::Status::Processing && self.csr.is_some() && self.certificate.is_none()
    }

    /// Recomputes the order status from its authorizations.
    ///
    /// `processing`, `valid` and `invalid` are authoritative and left alone.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        match self.status {
            types::order::Status::Processing | types::order::Status::Valid | types::order::Status::Invalid => return,
            types::order::Status::Pending | types::order::Status::Ready => {}
        }

        for authz in self.authorizations.iter_mut() {
            authz.refresh_status(now);
        }

        let any_failed = self.authorizations.iter().any(|a| a.status.is_final());
        let all_valid = self.authorizations.iter()
            .all(|a| a.status == types::authorization::Status::Valid);

        self.status = if any_failed || self.expires <= now {
            types::order::Status::Invalid
        } else if all_valid {
            types::order::Status::Ready
        } else {
            types::order::Status::Pending
        };
    }

    pub fn to_json(&self, base_url: &str) -> types::order::Order {
        let meta = self.cert_req_meta.clone().unwrap_or_default();
        types::order::Order {
            status: self.status,
            expires: self.expires,
            identifiers: self.identifiers(),
            not_before: meta.not_before,
            not_after: meta.not_after,
            error: self.error.clone(),
            authorizations: self.authorizations.iter().map(|a| authorization_url(base_url, a.id)).collect(),
            finalize: finalize_url(base_url, self.id),
            certificate: self.certificate.as_ref().map(|_| certificate_url(base_url, self.id)),
        }
    }
}
