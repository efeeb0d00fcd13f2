use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use base64::prelude::*;
use chrono::prelude::*;
use chrono::SubsecRound;
use crate::types;

pub mod contact;
pub mod csr;
pub mod db;
pub mod jws;
mod links;
pub mod models;
pub mod replay;
pub mod repo;
mod responses;
mod schema;

pub use responses::{Method, Request, Response};

pub type ACMEResult<I> = Result<I, types::error::Error>;

const ORDER_LIFETIME_DAYS: i64 = 7;
const CLEANUP_INTERVAL_DAYS: i64 = 1;

/// Why a request did not produce a success response.
#[derive(Debug)]
pub enum Rejection {
    Problem(types::error::Error),
    /// A bare status code with no body.
    Status(u16),
    /// An unexpected fault, already logged. The client only sees a generic 500.
    Internal,
}

impl From<types::error::Error> for Rejection {
    fn from(err: types::error::Error) -> Self {
        Rejection::Problem(err)
    }
}

impl From<repo::StoreError> for Rejection {
    fn from(err: repo::StoreError) -> Self {
        error!("Storage failure: {}", err);
        Rejection::Internal
    }
}

type Handled = Result<Response, Rejection>;

macro_rules! try_internal {
    ($src:expr, $err:expr) => {
        (match ($src) {
            Ok(inner) => inner,
            Err(err) => {
                error!($err, err);
                return Err(Rejection::Internal);
            }
        })
    }
}

macro_rules! malformed {
    ($detail:expr) => {
        Rejection::Problem(crate::problem!(Malformed, 400, "Bad request", $detail))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid base_url '{0}': {1}")]
    BaseUrl(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Directory,
    NewNonce,
    NewAccount,
    NewOrder,
    RevokeCert,
    KeyChange,
    Account,
    Orders,
    Order,
    Authorization,
    Challenge,
    Finalize,
    Certificate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyPolicy {
    Jwk,
    Kid,
    Either,
}

impl Command {
    fn from_segment(segment: &str) -> Option<Self> {
        Some(match segment.to_ascii_lowercase().as_str() {
            "" | "directory" => Command::Directory,
            "newnonce" => Command::NewNonce,
            "newaccount" => Command::NewAccount,
            "neworder" => Command::NewOrder,
            "revokecert" => Command::RevokeCert,
            "keychange" => Command::KeyChange,
            "acct" => Command::Account,
            "orders" => Command::Orders,
            "order" => Command::Order,
            "authz" => Command::Authorization,
            "chall" => Command::Challenge,
            "finalize" => Command::Finalize,
            "cert" => Command::Certificate,
            _ => return None,
        })
    }

    fn arg_count(&self) -> usize {
        match self {
            Command::Account | Command::Orders | Command::Order | Command::Authorization |
            Command::Finalize | Command::Certificate => 1,
            Command::Challenge => 2,
            _ => 0,
        }
    }

    fn key_policy(&self) -> KeyPolicy {
        match self {
            Command::NewAccount => KeyPolicy::Jwk,
            Command::RevokeCert => KeyPolicy::Either,
            _ => KeyPolicy::Kid,
        }
    }
}

#[derive(Debug)]
struct Route {
    command: Command,
    args: Vec<String>,
    /// Request path relative to the base URL.
    relative: String,
}

enum Signer {
    Account {
        account: models::Account,
        key: openssl::pkey::PKey<openssl::pkey::Public>,
    },
    Key {
        jwk: BTreeMap<String, String>,
        key: openssl::pkey::PKey<openssl::pkey::Public>,
    },
}

impl Signer {
    fn key(&self) -> &openssl::pkey::PKeyRef<openssl::pkey::Public> {
        match self {
            Signer::Account { key, .. } | Signer::Key { key, .. } => &**key,
        }
    }
}

/// An authenticated request: verified envelope, consumed nonce, resolved signer.
struct Signed {
    header: types::jose::JWSProtectedHeader,
    payload: Vec<u8>,
    signer: Signer,
}

impl Signed {
    fn account(&self) -> Result<&models::Account, Rejection> {
        match &self.signer {
            Signer::Account { account, .. } => Ok(account),
            Signer::Key { .. } => Err(malformed!("'jwk' field cannot be used")),
        }
    }

    fn is_post_as_get(&self) -> bool {
        self.payload.is_empty()
    }

    fn payload<R: serde::de::DeserializeOwned>(&self) -> Result<R, Rejection> {
        if self.is_post_as_get() {
            return Err(malformed!("POST-as-GET is not allowed"));
        }
        Ok(jws::decode_jws_payload(&self.payload)?)
    }
}

#[derive(Clone)]
struct IssuerChain {
    issuer_dn: Vec<u8>,
    certificates: Vec<openssl::x509::X509>,
}

/// Terminates ACME requests into store changes or rejections.
pub struct Gateway {
    config: Arc<crate::config::Config>,
    base_url: String,
    base_path: String,
    hosts: Vec<String>,
    repo: Arc<repo::Repository>,
    nonces: Arc<replay::NonceManager>,
    authority: Arc<dyn crate::ca::SigningAuthority>,
    cleaner: Arc<repo::OrderCleaner>,
    issuer_chains: tokio::sync::Mutex<HashMap<String, IssuerChain>>,
}

impl Gateway {
    pub fn new(
        config: Arc<crate::config::Config>,
        repo: Arc<repo::Repository>,
        nonces: Arc<replay::NonceManager>,
        authority: Arc<dyn crate::ca::SigningAuthority>,
    ) -> Result<Self, SetupError> {
        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let parsed = url::Url::parse(&base_url)
            .map_err(|err| SetupError::BaseUrl(base_url.clone(), err.to_string()))?;
        let host = parsed.host_str()
            .ok_or_else(|| SetupError::BaseUrl(base_url.clone(), "no host".to_string()))?
            .to_ascii_lowercase();
        let hosts = match parsed.port() {
            Some(port) => vec![format!("{}:{}", host, port)],
            None => {
                let mut hosts = vec![host.clone()];
                if let Some(port) = parsed.port_or_known_default() {
                    hosts.push(format!("{}:{}", host, port));
                }
                hosts
            }
        };

        Ok(Gateway {
            base_path: parsed.path().to_string(),
            base_url,
            hosts,
            config,
            repo,
            nonces,
            authority,
            cleaner: Arc::new(repo::OrderCleaner::new(chrono::Duration::days(CLEANUP_INTERVAL_DAYS))),
            issuer_chains: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Path component of the base URL, always ending in `/`.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    fn host_matches(&self, host: Option<&str>) -> bool {
        match host {
            Some(h) => {
                let h = h.trim().to_ascii_lowercase();
                self.hosts.iter().any(|e| *e == h)
            }
            None => false,
        }
    }

    fn route(&self, path: &str) -> Option<Route> {
        let relative = match path.strip_prefix(self.base_path.as_str()) {
            Some(r) => r,
            None if path == self.base_path.trim_end_matches('/') => "",
            None => return None,
        };
        let mut segments = relative.split('/');
        let command = Command::from_segment(segments.next().unwrap_or_default())?;
        let args: Vec<String> = segments.map(|s| s.to_string()).collect();
        if args.len() != command.arg_count() {
            return None;
        }
        Some(Route {
            command,
            args,
            relative: relative.to_string(),
        })
    }

    /// Handles one HTTP request end to end.
    pub async fn handle(&self, req: Request) -> Response {
        if !self.host_matches(req.host.as_deref()) {
            debug!("Rejecting request for unexpected host {:?}", req.host);
            return Response::empty(400);
        }
        let route = match self.route(&req.path) {
            Some(r) => r,
            None => return Response::empty(404),
        };

        let mut links = vec![];
        let resp = match self.dispatch(&route, &req, &mut links).await {
            Ok(r) => r,
            Err(Rejection::Problem(err)) => Response::problem(err),
            Err(Rejection::Status(status)) => Response::empty(status),
            Err(Rejection::Internal) => Response::problem(crate::internal_server_error!()),
        };
        if route.command == Command::Directory {
            return resp;
        }
        self.finish(resp, links)
    }

    fn finish(&self, mut resp: Response, mut links: Vec<links::LinkHeader>) -> Response {
        match self.nonces.issue() {
            Ok(nonce) => resp.headers.push(("Replay-Nonce".to_string(), nonce)),
            Err(err) => {
                error!("Unable to generate nonce: {}", err);
                return Response::problem(crate::internal_server_error!());
            }
        }
        links.push(links::LinkHeader::index(&self.base_url));
        links::adjoin_links(&mut resp, links);
        resp
    }

    async fn dispatch(&self, route: &Route, req: &Request, links: &mut Vec<links::LinkHeader>) -> Handled {
        match route.command {
            Command::Directory => return match req.method {
                Method::Get | Method::Head => Ok(self.directory()),
                _ => Err(Rejection::Status(405)),
            },
            Command::NewNonce => return match req.method {
                Method::Head => Ok(Response::empty(200).with_header("Cache-Control", "no-store")),
                Method::Get => Ok(Response::empty(204).with_header("Cache-Control", "no-store")),
                _ => Err(Rejection::Status(405)),
            },
            _ => {}
        }

        if req.method != Method::Post {
            return Err(Rejection::Status(405));
        }
        if !responses::is_jose_content_type(req.content_type.as_deref()) {
            return Err(malformed!("Content-Type must be application/jose+json"));
        }

        let signed = self.authenticate(req, route).await?;
        match route.command {
            Command::NewAccount => self.new_account(signed).await,
            Command::KeyChange => self.key_change(signed).await,
            Command::Account => self.account(signed, &route.args[0]).await,
            Command::RevokeCert => self.revoke_cert(signed).await,
            Command::Orders => self.orders(signed, &route.args[0]).await,
            Command::NewOrder => self.new_order(signed).await,
            Command::Order => self.order(signed, &route.args[0]).await,
            Command::Finalize => self.finalize(signed, &route.args[0]).await,
            Command::Certificate => self.certificate(signed, &route.args[0]).await,
            Command::Authorization => self.authorization(signed, &route.args[0]).await,
            Command::Challenge => self.challenge(signed, &route.args[0], &route.args[1], links).await,
            Command::Directory | Command::NewNonce => Err(Rejection::Status(405)),
        }
    }

    fn directory(&self) -> Response {
        Response::json(200, &types::directory::Directory {
            new_nonce: format!("{}newNonce", self.base_url),
            new_account: format!("{}newAccount", self.base_url),
            new_order: format!("{}newOrder", self.base_url),
            revoke_cert: format!("{}revokeCert", self.base_url),
            key_change: format!("{}keyChange", self.base_url),
            meta: Some(types::directory::Meta {
                terms_of_service: self.config.terms_of_service.clone(),
                website: self.config.website.clone(),
                caa_identities: self.config.caa_identities.clone(),
                external_account_required: false,
            }),
        })
    }

    async fn lookup_account(&self, kid: &str) -> ACMEResult<models::Account> {
        let prefix = format!("{}acct/", self.base_url);
        let account = match kid.strip_prefix(prefix.as_str()).and_then(crate::util::b64_to_id) {
            Some(id) => self.repo.get_account(id).await,
            None => None,
        };
        account.ok_or_else(|| crate::problem!(
            AccountDoesNotExist, 400, "Unknown account", format!("Account '{}' does not exist", kid)
        ))
    }

    async fn authenticate(&self, req: &Request, route: &Route) -> Result<Signed, Rejection> {
        let jws = jws::parse_flattened_jws(&req.body)?;
        let (header, payload, signature) = jws::start_decode_jws(&jws)?;

        let request_url = format!("{}{}", self.base_url, route.relative);
        if header.url.as_deref() != Some(request_url.as_str()) {
            return Err(malformed!(format!("JWS url does not match request URL '{}'", request_url)));
        }

        match header.nonce.as_deref() {
            Some(nonce) if self.nonces.consume(nonce) => {}
            Some(_) => return Err(crate::problem!(
                BadNonce, 400, "Bad nonce", "The nonce is invalid or has already been used"
            ).into()),
            None => return Err(crate::problem!(BadNonce, 400, "Bad nonce", "A nonce is required").into()),
        }

        let policy = route.command.key_policy();
        let signer = match (&header.jwk, &header.kid) {
            (Some(_), Some(_)) => return Err(malformed!("Only one of 'jwk' and 'kid' may be present")),
            (None, None) => return Err(malformed!("One of 'jwk' or 'kid' must be present")),
            (Some(jwk), None) => {
                if policy == KeyPolicy::Kid {
                    return Err(malformed!("'jwk' field cannot be used"));
                }
                let key = jws::jwk_to_key(jwk)?;
                let canonical = jws::canonical_jwk(&key)?;
                Signer::Key { jwk: canonical, key }
            }
            (None, Some(kid)) => {
                if policy == KeyPolicy::Jwk {
                    return Err(malformed!("'kid' field cannot be used"));
                }
                let account = self.lookup_account(kid).await?;
                if route.command == Command::Account && header.url.as_deref() != Some(kid.as_str()) {
                    return Err(malformed!("kid and url do not match"));
                }
                if account.status != types::account::Status::Valid {
                    return Err(crate::problem!(
                        Unauthorized, 401, "Unauthorized",
                        format!("Account '{}' is {}", kid, account.status.as_str())
                    ).into());
                }
                let key = try_internal!(account.public_key(), "Unable to decode stored account key: {}");
                Signer::Account { account, key }
            }
        };

        jws::verify_jws_sig(&jws, &header, &signature, signer.key())?;

        Ok(Signed {
            header,
            payload,
            signer,
        })
    }

    async fn new_account(&self, signed: Signed) -> Handled {
        let payload: types::account::AccountCreate = signed.payload()?;
        let jwk = match &signed.signer {
            Signer::Key { jwk, .. } => jwk.clone(),
            Signer::Account { .. } => return Err(malformed!("'kid' field cannot be used")),
        };

        if let Some(existing) = self.repo.get_account_by_jwk(&jwk).await {
            return Ok(Response::json(200, &existing.to_json(&self.base_url))
                .with_location(models::account_url(&self.base_url, existing.id)));
        }

        if payload.only_return_existing {
            return Err(crate::problem!(
                AccountDoesNotExist, 400, "Unknown account", "No account exists for the given key"
            ).into());
        }
        if !payload.terms_of_service_agreed {
            return Err(crate::problem!(
                UserActionRequired, 401, "Terms of service", "Terms of service have not been agreed to"
            ).into());
        }
        if !payload.contact.is_empty() {
            self.config.contact_verifier.verify_all(&payload.contact)?;
        }

        let account = models::Account {
            id: 0,
            status: types::account::Status::Valid,
            jwk,
            contacts: payload.contact,
            eab: payload.external_account_binding,
            created_at: Utc::now(),
        };
        let (status, account) = match self.repo.add_account(account).await? {
            repo::AccountInsert::Created(account) => {
                info!("Created account {}", crate::util::id_to_b64(account.id));
                (201, account)
            }
            repo::AccountInsert::Existing(account) => (200, account),
        };
        Ok(Response::json(status, &account.to_json(&self.base_url))
            .with_location(models::account_url(&self.base_url, account.id)))
    }

    fn key_conflict(&self, holder: &models::Account) -> Response {
        Response::empty(409).with_location(models::account_url(&self.base_url, holder.id))
    }

    async fn key_change(&self, signed: Signed) -> Handled {
        let account = signed.account()?;
        let inner_jws: types::jose::FlattenedJWS = signed.payload()?;
        let (inner_header, inner_payload, inner_signature) = jws::start_decode_jws(&inner_jws)?;

        let new_jwk = match (&inner_header.jwk, &inner_header.kid) {
            (Some(jwk), None) => jwk,
            _ => return Err(malformed!("Inner JWS must carry 'jwk' and not 'kid'")),
        };
        if inner_header.url != signed.header.url {
            return Err(malformed!("Inner JWS url does not match outer url"));
        }
        let new_key = jws::jwk_to_key(new_jwk)?;
        let new_canonical = jws::canonical_jwk(&new_key)?;

        if let Some(holder) = self.repo.get_account_by_jwk(&new_canonical).await {
            return Ok(self.key_conflict(&holder));
        }

        let inner: types::account::KeyChange = jws::decode_jws_payload(&inner_payload)?;
        if Some(inner.account.as_str()) != signed.header.kid.as_deref() {
            return Err(malformed!("Inner payload account does not match kid"));
        }
        let old_key = jws::jwk_to_key(&inner.old_key)
            .and_then(|key| jws::canonical_jwk(&key))
            .map_err(|err| malformed!(format!("Invalid oldKey: {}", err.detail)))?;
        if old_key != account.jwk {
            return Err(malformed!("oldKey does not match the account key"));
        }
        if let Err(err) = jws::verify_jws_sig(&inner_jws, &inner_header, &inner_signature, &new_key) {
            return Err(malformed!(format!("Inner JWS signature is not valid: {}", err.detail)));
        }

        match self.repo.key_change(account.id, new_canonical).await? {
            repo::KeyChangeOutcome::Changed(updated) => {
                info!("Changed key of account {}", crate::util::id_to_b64(updated.id));
                Ok(Response::json(200, &updated.to_json(&self.base_url))
                    .with_location(models::account_url(&self.base_url, updated.id)))
            }
            repo::KeyChangeOutcome::Conflict(holder) => Ok(self.key_conflict(&holder)),
            repo::KeyChangeOutcome::NotFound => Err(crate::problem!(
                AccountDoesNotExist, 400, "Unknown account", "Account no longer exists"
            ).into()),
        }
    }

    async fn account(&self, signed: Signed, id: &str) -> Handled {
        let account = signed.account()?;
        if crate::util::b64_to_id(id) != Some(account.id) {
            return Err(Rejection::Status(404));
        }
        if signed.is_post_as_get() {
            return Ok(Response::json(200, &account.to_json(&self.base_url)));
        }

        let types::account::AccountUpdate { contact, status } = signed.payload()?;
        if status == Some(types::account::Status::Revoked) {
            return Err(crate::problem!(
                Unauthorized, 401, "Unauthorized", "Accounts cannot be revoked by the client"
            ).into());
        }
        let contact = contact.filter(|c| !c.is_empty());
        if let Some(contact) = &contact {
            self.config.contact_verifier.verify_all(contact)?;
        }

        let updated = self.repo.update_account(account.id, |a| {
            if status == Some(types::account::Status::Deactivated) {
                a.status = types::account::Status::Deactivated;
            }
            if let Some(contact) = contact {
                a.contacts = contact;
            }
            a.clone()
        }).await?.ok_or(Rejection::Status(404))?;

        if updated.status == types::account::Status::Deactivated && account.status != updated.status {
            info!("Deactivated account {}", crate::util::id_to_b64(updated.id));
        }
        Ok(Response::json(200, &updated.to_json(&self.base_url)))
    }

    async fn revoke_cert(&self, signed: Signed) -> Handled {
        let payload: types::account::Revocation = signed.payload()?;
        let code = payload.reason.unwrap_or(0);
        let reason = crate::ca::CrlReason::from_code(code).ok_or_else(|| crate::problem!(
            BadRevocationReason, 400, "Bad revocation reason", format!("Revocation reason {} is not allowed", code)
        ))?;

        let der = BASE64_URL_SAFE_NO_PAD.decode(payload.certificate.trim_end_matches('='))
            .map_err(|_| malformed!("Certificate is not valid base64url"))?;
        let cert = openssl::x509::X509::from_der(&der)
            .map_err(|_| malformed!("Unable to parse certificate"))?;

        let unauthorized = || crate::problem!(
            Unauthorized, 400, "Unauthorized", "Not authorized to revoke this certificate"
        );
        if let Signer::Key { key, .. } = &signed.signer {
            let cert_key = cert.public_key().map_err(|_| unauthorized())?;
            if !cert_key.public_eq(&**key) {
                return Err(unauthorized().into());
            }
        }
        let order = self.repo.get_order_for_certificate(&der).await.ok_or_else(unauthorized)?;
        if let Signer::Account { account, .. } = &signed.signer {
            if order.account_id != account.id {
                return Err(unauthorized().into());
            }
        }

        let serial = try_internal!(
            cert.serial_number().to_bn().and_then(|bn| bn.to_hex_str().map(|s| s.to_string())),
            "Unable to encode certificate serial: {}"
        ).to_ascii_uppercase();
        let ca = match order.cert_req_meta.as_ref().and_then(|m| m.ca.clone()) {
            Some(ca) => ca,
            None => {
                error!("Order {} has a certificate but no CA", crate::util::id_to_b64(order.id));
                return Err(Rejection::Internal);
            }
        };

        match self.authority.revoke_certificate(&ca, &serial, reason).await {
            Ok(()) => {
                info!("Revoked certificate {} of CA '{}' with reason {}", serial, ca, code);
                Ok(Response::empty(200))
            }
            Err(crate::ca::RevokeError::AlreadyRevoked) => Err(crate::problem!(
                AlreadyRevoked, 400, "Already revoked", "The certificate has already been revoked"
            ).into()),
            Err(crate::ca::RevokeError::UnknownCertificate) => Err(malformed!("certificate is unknown")),
            Err(crate::ca::RevokeError::Rejected(detail)) => Err(crate::problem!(
                Unauthorized, 403, "Revocation rejected", detail
            ).into()),
            Err(err @ crate::ca::RevokeError::Unavailable(_)) => {
                error!("Unable to revoke certificate {}: {}", serial, err);
                Err(Rejection::Internal)
            }
        }
    }

    async fn orders(&self, signed: Signed, id: &str) -> Handled {
        let account = signed.account()?;
        let (cert_age, order_age) = self.config.cleanup_ages();
        repo::spawn_cleanup(&self.repo, &self.cleaner, cert_age, order_age);

        if crate::util::b64_to_id(id) != Some(account.id) {
            return Err(Rejection::Status(404));
        }
        let orders = self.repo.get_orders_for_account(account.id).into_iter()
            .map(|id| models::order_url(&self.base_url, id))
            .collect();
        Ok(Response::json(200, &types::order::List { orders }))
    }

    async fn new_order(&self, signed: Signed) -> Handled {
        let account = signed.account()?;
        let payload: types::order::OrderCreate = signed.payload()?;
        if payload.identifiers.is_empty() {
            return Err(malformed!("At least one identifier is required"));
        }
        if let (Some(not_before), Some(not_after)) = (payload.not_before, payload.not_after) {
            if not_before >= not_after {
                return Err(malformed!("notBefore must be earlier than notAfter"));
            }
        }

        let mut identifiers: Vec<types::identifier::Identifier> = vec![];
        for requested in &payload.identifiers {
            if types::identifier::Type::from_str(&requested.id_type).is_none() {
                return Err(crate::problem!(
                    UnsupportedIdentifier, 400, "Unsupported identifier",
                    format!("'{}' identifiers are not supported", requested.id_type)
                ).into());
            }
            let value = requested.value.trim().to_ascii_lowercase();
            let domain = value.strip_prefix("*.").unwrap_or(&value);
            if domain.is_empty() {
                return Err(malformed!("Identifier value must not be empty"));
            }
            if domain.contains('*') {
                return Err(crate::problem!(
                    UnsupportedIdentifier, 400, "Unsupported identifier",
                    format!("Wildcard identifier '{}' is not supported", value)
                ).into());
            }
            let identifier = types::identifier::Identifier::dns(&value);
            if !identifiers.contains(&identifier) {
                identifiers.push(identifier);
            }
        }

        let now = Utc::now().trunc_subsecs(0);
        let expires = now + chrono::Duration::days(ORDER_LIFETIME_DAYS);
        let thumbprint = account.thumbprint();
        let mut authorizations = vec![];
        for identifier in identifiers {
            let challenge_types: &[types::challenge::Type] = if identifier.is_wildcard() {
                &[types::challenge::Type::DNS01]
            } else {
                &types::challenge::Type::ALL
            };
            let mut challenges = vec![];
            for (sub_id, challenge_type) in challenge_types.iter().enumerate() {
                let token = try_internal!(
                    crate::util::random_token(self.config.token_num_bytes), "Unable to generate token: {}"
                );
                challenges.push(try_internal!(
                    models::Challenge::new(sub_id as u32, *challenge_type, token, &thumbprint),
                    "Unable to compute key authorization: {}"
                ));
            }
            authorizations.push(models::Authorization {
                id: 0,
                identifier,
                status: types::authorization::Status::Pending,
                expires,
                challenges,
            });
        }

        let cert_req_meta = if payload.not_before.is_some() || payload.not_after.is_some() {
            Some(models::CertReqMeta {
                not_before: payload.not_before,
                not_after: payload.not_after,
                ..Default::default()
            })
        } else {
            None
        };

        let order = models::Order {
            id: 0,
            account_id: account.id,
            status: types::order::Status::Pending,
            expires,
            created_at: now,
            authorizations,
            cert_req_meta,
            csr: None,
            certificate: None,
            cert_not_after: None,
            error: None,
        };
        let order = self.repo.add_order(account.id, order).await?;
        info!(
            "Created order {} for account {} with {} identifiers",
            crate::util::id_to_b64(order.id), crate::util::id_to_b64(account.id), order.authorizations.len()
        );
        Ok(Response::json(201, &order.to_json(&self.base_url))
            .with_location(models::order_url(&self.base_url, order.id)))
    }

    async fn order(&self, signed: Signed, id: &str) -> Handled {
        let account = signed.account()?;
        let order_id = crate::util::b64_to_id(id).ok_or(Rejection::Status(404))?;
        let now = Utc::now();
        let order = self.repo.update_order(order_id, |o| {
            if o.account_id != account.id {
                return None;
            }
            o.refresh_status(now);
            Some(o.clone())
        }).await?.flatten().ok_or(Rejection::Status(404))?;
        Ok(Response::json(200, &order.to_json(&self.base_url))
            .with_location(models::order_url(&self.base_url, order.id)))
    }

    async fn finalize(&self, signed: Signed, id: &str) -> Handled {
        let account = signed.account()?;
        let order_id = crate::util::b64_to_id(id).ok_or(Rejection::Status(404))?;
        let payload: types::order::OrderFinalize = signed.payload()?;
        let csr_der = BASE64_URL_SAFE_NO_PAD.decode(payload.csr.trim_end_matches('='))
            .map_err(|_| crate::problem!(BadCSR, 400, "Invalid CSR", "CSR is not valid base64url"))?;

        let now = Utc::now();
        let profiles = &self.config.ca_profiles;
        let order = self.repo.update_order(order_id, |o| -> Option<ACMEResult<models::Order>> {
            if o.account_id != account.id {
                return None;
            }
            o.refresh_status(now);
            Some(match o.status {
                types::order::Status::Pending => Err(crate::problem!(
                    OrderNotReady, 403, "Order not ready", "Order is not ready"
                )),
                types::order::Status::Invalid => Err(crate::problem!(
                    Unauthorized, 403, "Order invalid", "Order is invalid"
                )),
                types::order::Status::Processing => Err(crate::problem!(
                    OrderNotReady, 403, "Order not ready", "Enrolling certificate is processing"
                )),
                types::order::Status::Valid => Err(crate::problem!(
                    OrderNotReady, 403, "Order not ready", "Certificate has been issued"
                )),
                types::order::Status::Ready => match csr::check_csr(&csr_der, &o.identifiers(), profiles) {
                    Ok(target) => {
                        let meta = o.cert_req_meta.get_or_insert_with(Default::default);
                        meta.ca = Some(target.ca);
                        meta.profile = Some(target.profile);
                        o.csr = Some(csr_der);
                        o.status = types::order::Status::Processing;
                        o.error = None;
                        Ok(o.clone())
                    }
                    Err(err) => Err(err),
                },
            })
        }).await?.flatten().ok_or(Rejection::Status(404))??;

        info!("Order {} finalized, awaiting enrollment", crate::util::id_to_b64(order.id));
        Ok(Response::json(200, &order.to_json(&self.base_url))
            .with_location(models::order_url(&self.base_url, order.id)))
    }

    async fn issuer_chain(
        &self, ca: &str, leaf: &openssl::x509::X509Ref,
    ) -> Result<Vec<openssl::x509::X509>, Rejection> {
        let issuer_dn = try_internal!(leaf.issuer_name().to_der(), "Unable to encode issuer name: {}");
        if let Some(cached) = self.issuer_chains.lock().await.get(ca) {
            if cached.issuer_dn == issuer_dn {
                return Ok(cached.certificates.clone());
            }
        }

        // Fetched unlocked; a concurrent miss for the same CA just fetches twice.

        let ders = match self.authority.issuer_chain(ca).await {
            Ok(c) => c,
            Err(err) => {
                error!("Unable to fetch issuer chain of CA '{}': {}", ca, err);
                return Err(Rejection::Internal);
            }
        };
        let certificates = try_internal!(
            ders.iter().map(|d| openssl::x509::X509::from_der(d)).collect::<Result<Vec<_>, _>>(),
            "Invalid issuer certificate from signing authority: {}"
        );
        debug!("Cached {} issuer certificates for CA '{}'", certificates.len(), ca);
        self.issuer_chains.lock().await.insert(ca.to_string(), IssuerChain {
            issuer_dn,
            certificates: certificates.clone(),
        });
        Ok(certificates)
    }

    async fn certificate(&self, signed: Signed, id: &str) -> Handled {
        let account = signed.account()?;
        let order_id = crate::util::b64_to_id(id).ok_or(Rejection::Status(404))?;
        let order = match self.repo.get_order(order_id).await {
            Some(o) if o.account_id == account.id => o,
            _ => return Err(Rejection::Status(404)),
        };
        let der = match &order.certificate {
            Some(c) => c,
            None => return Err(crate::problem!(
                OrderNotReady, 404, "Certificate not ready", "The certificate has not been issued"
            ).into()),
        };

        let leaf = try_internal!(openssl::x509::X509::from_der(der), "Unable to parse stored certificate: {}");
        let mut pem = try_internal!(leaf.to_pem(), "Unable to encode certificate: {}");
        if let Some(ca) = order.cert_req_meta.as_ref().and_then(|m| m.ca.as_deref()) {
            for cert in self.issuer_chain(ca, &leaf).await? {
                pem.extend(try_internal!(cert.to_pem(), "Unable to encode issuer certificate: {}"));
            }
        }
        Ok(Response::pem_chain(pem))
    }

    async fn authorization(&self, signed: Signed, id: &str) -> Handled {
        let account = signed.account()?;
        let authz_id = crate::util::b64_to_id(id).ok_or(Rejection::Status(404))?;
        let order_id = match self.repo.get_authorization(authz_id).await {
            Some(a) if a.account_id == account.id => a.order_id,
            _ => return Err(Rejection::Status(404)),
        };
        let deactivate = if signed.is_post_as_get() {
            false
        } else {
            let update: types::authorization::AuthorizationUpdate = signed.payload()?;
            match update.status {
                None => false,
                Some(types::authorization::Status::Deactivated) => true,
                Some(_) => return Err(malformed!("Authorizations may only be deactivated")),
            }
        };

        let now = Utc::now();
        let authz = self.repo.update_order(order_id, |o| -> Option<ACMEResult<models::Authorization>> {
            if o.account_id != account.id {
                return None;
            }
            o.refresh_status(now);
            let authz = o.authorization_mut(authz_id)?;
            authz.refresh_status(now);
            if deactivate {
                match authz.status {
                    types::authorization::Status::Pending | types::authorization::Status::Valid => {
                        authz.status = types::authorization::Status::Deactivated;
                    }
                    _ => return Some(Err(crate::problem!(
                        Malformed, 400, "Bad request", "Only pending or valid authorizations can be deactivated"
                    ))),
                }
            }
            let authz = authz.clone();
            o.refresh_status(now);
            Some(Ok(authz))
        }).await?.flatten().ok_or(Rejection::Status(404))??;

        Ok(Response::json(200, &authz.to_json(&self.base_url)))
    }

    async fn challenge(
        &self, signed: Signed, authz_id: &str, sub_id: &str, links: &mut Vec<links::LinkHeader>,
    ) -> Handled {
        let account = signed.account()?;
        let id = match (crate::util::b64_to_id(authz_id), crate::util::b64_to_sub_id(sub_id)) {
            (Some(authz_id), Some(sub_id)) => models::ChallengeId { authz_id, sub_id },
            _ => return Err(Rejection::Status(404)),
        };
        let owned = match self.repo.get_challenge(id).await {
            Some(c) if c.account_id == account.id => c,
            _ => return Err(Rejection::Status(404)),
        };
        let up = links::LinkHeader::up(models::authorization_url(&self.base_url, id.authz_id));
        if owned.item.status != types::challenge::Status::Pending {
            links.push(up);
            return Ok(Response::json(200, &owned.item.to_json(&self.base_url, id.authz_id)));
        }

        let now = Utc::now();
        let chall = self.repo.update_order(owned.order_id, |o| {
            if o.account_id != account.id {
                return None;
            }
            o.refresh_status(now);
            let authz = o.authorization_mut(id.authz_id)?;
            authz.refresh_status(now);
            let authz_pending = authz.status == types::authorization::Status::Pending;
            let chall = authz.challenge_mut(id.sub_id)?;
            if authz_pending && chall.status == types::challenge::Status::Pending {
                chall.status = types::challenge::Status::Processing;
            }
            Some(chall.clone())
        }).await?.flatten().ok_or(Rejection::Status(404))?;

        links.push(up);
        Ok(Response::json(200, &chall.to_json(&self.base_url, id.authz_id)))
    }
}
