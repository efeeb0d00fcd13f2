use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use acme_gateway::acme::{Method, Request, Response};
use acme_gateway::ca::{CaError, CrlReason, RevokeError, SigningAuthority};
use acme_gateway::types;
use acme_gateway::validator::{ChallengeProbe, ProbeOutcome};
use base64::prelude::*;
use openssl::pkey::{PKey, Private};
use serde_json::{json, Value};

const BASE_URL: &str = "https://acme.test/acme/";
const HOST: &str = "acme.test";

fn p256() -> PKey<Private> {
    let group = openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap()
}

fn b64(data: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(data)
}

/// Issues leaf certificates from a throwaway CA.
struct TestAuthority {
    ca_key: PKey<Private>,
    ca_cert: openssl::x509::X509,
    next_serial: AtomicU32,
    revoked: Mutex<HashSet<String>>,
}

impl TestAuthority {
    fn new() -> Self {
        let ca_key = p256();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, "Test CA").unwrap();
        let name = name.build();
        let mut builder = openssl::x509::X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&ca_key).unwrap();
        builder.set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&openssl::asn1::Asn1Time::days_from_now(365).unwrap()).unwrap();
        builder.sign(&ca_key, openssl::hash::MessageDigest::sha256()).unwrap();
        TestAuthority {
            ca_key,
            ca_cert: builder.build(),
            next_serial: AtomicU32::new(0x1000),
            revoked: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait::async_trait]
impl SigningAuthority for TestAuthority {
    async fn issue_certificate(
        &self, ca: &str, _profile: &str, csr: &[u8],
        _not_before: Option<chrono::DateTime<chrono::Utc>>, _not_after: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<u8>, CaError> {
        assert_eq!(ca, "test-ca");
        let req = openssl::x509::X509Req::from_der(csr).map_err(|e| CaError::Rejected(e.to_string()))?;
        let serial = openssl::bn::BigNum::from_u32(self.next_serial.fetch_add(1, Ordering::SeqCst)).unwrap();
        let mut builder = openssl::x509::X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
        builder.set_subject_name(req.subject_name()).unwrap();
        builder.set_issuer_name(self.ca_cert.subject_name()).unwrap();
        builder.set_pubkey(&req.public_key().unwrap()).unwrap();
        builder.set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&openssl::asn1::Asn1Time::days_from_now(90).unwrap()).unwrap();
        builder.sign(&self.ca_key, openssl::hash::MessageDigest::sha256()).unwrap();
        Ok(builder.build().to_der().unwrap())
    }

    async fn revoke_certificate(&self, _ca: &str, serial_hex: &str, _reason: CrlReason) -> Result<(), RevokeError> {
        if self.revoked.lock().unwrap().insert(serial_hex.to_string()) {
            Ok(())
        } else {
            Err(RevokeError::AlreadyRevoked)
        }
    }

    async fn issuer_chain(&self, _ca: &str) -> Result<Vec<Vec<u8>>, CaError> {
        Ok(vec![self.ca_cert.to_der().unwrap()])
    }
}

/// Passes dns-01 and fails everything else.
struct DnsOnlyProbe;

#[async_trait::async_trait]
impl ChallengeProbe for DnsOnlyProbe {
    async fn probe(&self, challenge_type: types::challenge::Type, _: &str, _: &str, _: &str) -> ProbeOutcome {
        match challenge_type {
            types::challenge::Type::DNS01 => ProbeOutcome::Valid,
            _ => ProbeOutcome::Invalid(types::error::Error {
                error_type: types::error::Type::IncorrectResponse,
                title: "Validation failed".to_string(),
                status: 400,
                detail: "not reachable".to_string(),
                instance: None,
                sub_problems: vec![],
                identifier: None,
            }),
        }
    }
}

struct Harness {
    service: acme_gateway::lifecycle::Service,
    validator: acme_gateway::validator::worker::ChallengeValidator,
    enroller: acme_gateway::enroller::CertEnroller,
    nonce: Option<String>,
}

struct AcmeClient {
    key: PKey<Private>,
    kid: Option<String>,
}

fn jwk(key: &PKey<Private>) -> Value {
    let ec = key.ec_key().unwrap();
    let mut ctx = openssl::bn::BigNumContext::new().unwrap();
    let mut x = openssl::bn::BigNum::new().unwrap();
    let mut y = openssl::bn::BigNum::new().unwrap();
    ec.public_key().affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx).unwrap();
    json!({
        "kty": "EC",
        "crv": "P-256",
        "x": b64(&x.to_vec_padded(32).unwrap()),
        "y": b64(&y.to_vec_padded(32).unwrap()),
    })
}

fn sign_jws(key: &PKey<Private>, protected: Value, payload: &str) -> Value {
    let protected = b64(protected.to_string().as_bytes());
    let payload = b64(payload.as_bytes());
    let msg = format!("{}.{}", protected, payload);
    let mut signer = openssl::sign::Signer::new(openssl::hash::MessageDigest::sha256(), key).unwrap();
    let der = signer.sign_oneshot_to_vec(msg.as_bytes()).unwrap();
    let sig = openssl::ecdsa::EcdsaSig::from_der(&der).unwrap();
    let mut raw = sig.r().to_vec_padded(32).unwrap();
    raw.extend(sig.s().to_vec_padded(32).unwrap());
    json!({"protected": protected, "payload": payload, "signature": b64(&raw)})
}

fn path_of(url: &str) -> String {
    url.strip_prefix("https://acme.test").unwrap().to_string()
}

fn json_body(resp: &Response) -> Value {
    serde_json::from_slice(&resp.body).unwrap()
}

fn problem_type(resp: &Response) -> String {
    assert_eq!(resp.content_type.as_deref(), Some("application/problem+json"));
    json_body(resp)["type"].as_str().unwrap().to_string()
}

fn csr(key: &PKey<Private>, names: &[&str]) -> Vec<u8> {
    let mut builder = openssl::x509::X509ReqBuilder::new().unwrap();
    builder.set_pubkey(key).unwrap();
    let mut name = openssl::x509::X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, names[0]).unwrap();
    builder.set_subject_name(&name.build()).unwrap();
    let ext = {
        let ctx = builder.x509v3_context(None);
        let mut san = openssl::x509::extension::SubjectAlternativeName::new();
        for n in names {
            san.dns(n);
        }
        san.build(&ctx).unwrap()
    };
    let mut stack = openssl::stack::Stack::new().unwrap();
    stack.push(ext).unwrap();
    builder.add_extensions(&stack).unwrap();
    builder.sign(key, openssl::hash::MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

impl Harness {
    async fn new() -> (Self, Arc<TestAuthority>) {
        let config: acme_gateway::config::Config = serde_json::from_value(json!({
            "base_url": BASE_URL,
            "terms_of_service": "https://acme.test/tos",
            "ca_profiles": [{
                "ca": "test-ca",
                "tls_profile": "tls-server",
                "key_types": ["1.2.840.10045.2.1"],
            }],
        })).unwrap();
        let workers = config.workers.clone();
        let authority = Arc::new(TestAuthority::new());
        let probe: Arc<dyn ChallengeProbe> = Arc::new(DnsOnlyProbe);
        let service = acme_gateway::lifecycle::Service::build(
            config, Arc::new(acme_gateway::acme::repo::MemoryBackend::new()), probe.clone(), authority.clone(),
        ).await.unwrap();
        let validator = acme_gateway::validator::worker::ChallengeValidator::new(
            service.repo().clone(), probe, &workers,
        );
        let enroller = acme_gateway::enroller::CertEnroller::new(
            service.repo().clone(), authority.clone(), &workers,
        );
        (Harness { service, validator, enroller, nonce: None }, authority)
    }

    async fn send(&mut self, method: Method, path: &str, content_type: Option<&str>, body: Vec<u8>) -> Response {
        let resp = self.service.gateway().handle(Request {
            method,
            path: path.to_string(),
            host: Some(HOST.to_string()),
            content_type: content_type.map(|c| c.to_string()),
            body,
        }).await;
        if let Some(nonce) = resp.header("Replay-Nonce") {
            self.nonce = Some(nonce.to_string());
        }
        resp
    }

    async fn fresh_nonce(&mut self) -> String {
        match self.nonce.take() {
            Some(n) => n,
            None => {
                self.send(Method::Head, "/acme/newNonce", None, vec![]).await;
                self.nonce.take().unwrap()
            }
        }
    }

    async fn post_jws(&mut self, url: &str, jws: Value) -> Response {
        self.send(
            Method::Post, &path_of(url), Some("application/jose+json"), jws.to_string().into_bytes(),
        ).await
    }

    /// Signs `payload` with the client's key, by `kid` once the account exists. `None` is POST-as-GET.
    async fn post(&mut self, client: &AcmeClient, url: &str, payload: Option<Value>) -> Response {
        let nonce = self.fresh_nonce().await;
        let mut protected = json!({"alg": "ES256", "nonce": nonce, "url": url});
        match &client.kid {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = jwk(&client.key),
        }
        let payload = payload.map(|p| p.to_string()).unwrap_or_default();
        let jws = sign_jws(&client.key, protected, &payload);
        self.post_jws(url, jws).await
    }

    async fn new_account(&mut self) -> AcmeClient {
        let mut client = AcmeClient { key: p256(), kid: None };
        let resp = self.post(
            &client, &format!("{}newAccount", BASE_URL),
            Some(json!({"termsOfServiceAgreed": true, "contact": ["mailto:admin@example.com"]})),
        ).await;
        assert_eq!(resp.status, 201);
        client.kid = Some(resp.header("Location").unwrap().to_string());
        client
    }

    /// Creates an order and drives every authorization to `valid` through dns-01.
    async fn ready_order(&mut self, client: &AcmeClient, names: &[&str]) -> (String, Value) {
        let identifiers: Vec<Value> = names.iter().map(|n| json!({"type": "dns", "value": n})).collect();
        let resp = self.post(client, &format!("{}newOrder", BASE_URL), Some(json!({"identifiers": identifiers}))).await;
        assert_eq!(resp.status, 201);
        let order_url = resp.header("Location").unwrap().to_string();
        let order = json_body(&resp);
        assert_eq!(order["status"], "pending");

        for authz_url in order["authorizations"].as_array().unwrap() {
            let resp = self.post(client, authz_url.as_str().unwrap(), None).await;
            let authz = json_body(&resp);
            let dns = authz["challenges"].as_array().unwrap().iter()
                .find(|c| c["type"] == "dns-01").unwrap()["url"].as_str().unwrap().to_string();
            let resp = self.post(client, &dns, Some(json!({}))).await;
            assert_eq!(json_body(&resp)["status"], "processing");
        }
        assert_eq!(self.validator.run_pass().await, names.len());

        let resp = self.post(client, &order_url, None).await;
        let order = json_body(&resp);
        assert_eq!(order["status"], "ready");
        (order_url, order)
    }

    /// Runs an order through issuance and returns the leaf certificate with its key.
    async fn issue(&mut self, client: &AcmeClient, names: &[&str]) -> (openssl::x509::X509, PKey<Private>) {
        let (order_url, order) = self.ready_order(client, names).await;
        let cert_key = p256();
        let resp = self.post(
            client, order["finalize"].as_str().unwrap(), Some(json!({"csr": b64(&csr(&cert_key, names))})),
        ).await;
        assert_eq!(resp.status, 200);
        assert_eq!(self.enroller.run_pass().await, 1);
        let order = json_body(&self.post(client, &order_url, None).await);
        let resp = self.post(client, order["certificate"].as_str().unwrap(), None).await;
        let leaf = openssl::x509::X509::stack_from_pem(&resp.body).unwrap().remove(0);
        (leaf, cert_key)
    }
}

#[tokio::test]
async fn full_issuance_flow() {
    let (mut h, authority) = Harness::new().await;

    let resp = h.send(Method::Get, "/acme/directory", None, vec![]).await;
    assert_eq!(resp.status, 200);
    assert!(resp.header("Replay-Nonce").is_none());
    let directory = json_body(&resp);
    assert_eq!(directory["newAccount"], format!("{}newAccount", BASE_URL));
    assert_eq!(directory["meta"]["termsOfService"], "https://acme.test/tos");

    let client = h.new_account().await;
    let again = h.post(
        &AcmeClient { key: client.key.clone(), kid: None },
        &format!("{}newAccount", BASE_URL), Some(json!({"termsOfServiceAgreed": true})),
    ).await;
    assert_eq!(again.status, 200);
    assert_eq!(again.header("Location"), client.kid.as_deref());

    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "example.com"}]
    }))).await;
    assert_eq!(resp.status, 201);
    let order_url = resp.header("Location").unwrap().to_string();
    let order = json_body(&resp);
    let authz_url = order["authorizations"][0].as_str().unwrap().to_string();

    let resp = h.post(&client, &authz_url, None).await;
    let authz = json_body(&resp);
    let mut types: Vec<&str> = authz["challenges"].as_array().unwrap().iter()
        .map(|c| c["type"].as_str().unwrap()).collect();
    types.sort();
    assert_eq!(types, vec!["dns-01", "http-01", "tls-alpn-01"]);
    let dns_url = authz["challenges"].as_array().unwrap().iter()
        .find(|c| c["type"] == "dns-01").unwrap()["url"].as_str().unwrap().to_string();

    let resp = h.post(&client, &dns_url, Some(json!({}))).await;
    assert_eq!(resp.status, 200);
    assert_eq!(json_body(&resp)["status"], "processing");
    assert!(resp.header_values("Link").contains(&format!("<{}>;rel=\"up\"", authz_url).as_str()));

    assert_eq!(h.validator.run_pass().await, 1);
    let resp = h.post(&client, &dns_url, None).await;
    assert_eq!(json_body(&resp)["status"], "valid");
    assert!(resp.header_values("Link").contains(&format!("<{}>;rel=\"up\"", authz_url).as_str()));
    let order = json_body(&h.post(&client, &order_url, None).await);
    assert_eq!(order["status"], "ready");

    let cert_key = p256();
    let resp = h.post(&client, order["finalize"].as_str().unwrap(), Some(json!({
        "csr": b64(&csr(&cert_key, &["example.com"]))
    }))).await;
    assert_eq!(resp.status, 200);
    assert_eq!(json_body(&resp)["status"], "processing");

    assert_eq!(h.enroller.run_pass().await, 1);
    let order = json_body(&h.post(&client, &order_url, None).await);
    assert_eq!(order["status"], "valid");
    let cert_url = order["certificate"].as_str().unwrap().to_string();

    let resp = h.post(&client, &cert_url, None).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.content_type.as_deref(), Some("application/pem-certificate-chain"));
    let chain = openssl::x509::X509::stack_from_pem(&resp.body).unwrap();
    assert_eq!(chain.len(), 2);
    assert!(chain[0].public_key().unwrap().public_eq(&cert_key));
    assert_eq!(chain[1].to_der().unwrap(), authority.ca_cert.to_der().unwrap());

    let revoke = json!({"certificate": b64(&chain[0].to_der().unwrap()), "reason": 1});
    let resp = h.post(&client, &format!("{}revokeCert", BASE_URL), Some(revoke.clone())).await;
    assert_eq!(resp.status, 200);
    let resp = h.post(&client, &format!("{}revokeCert", BASE_URL), Some(revoke)).await;
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:alreadyRevoked");
}

#[tokio::test]
async fn failed_challenge_invalidates_order() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "example.org"}]
    }))).await;
    let order_url = resp.header("Location").unwrap().to_string();
    let authz_url = json_body(&resp)["authorizations"][0].as_str().unwrap().to_string();
    let authz = json_body(&h.post(&client, &authz_url, None).await);
    let http_url = authz["challenges"].as_array().unwrap().iter()
        .find(|c| c["type"] == "http-01").unwrap()["url"].as_str().unwrap().to_string();

    h.post(&client, &http_url, Some(json!({}))).await;
    h.validator.run_pass().await;

    let authz = json_body(&h.post(&client, &authz_url, None).await);
    assert_eq!(authz["status"], "invalid");
    let order = json_body(&h.post(&client, &order_url, None).await);
    assert_eq!(order["status"], "invalid");
}

#[tokio::test]
async fn csr_must_match_identifiers() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let (order_url, order) = h.ready_order(&client, &["a.com", "b.com"]).await;
    let finalize = order["finalize"].as_str().unwrap().to_string();
    let key = p256();

    let resp = h.post(&client, &finalize, Some(json!({"csr": b64(&csr(&key, &["a.com"]))}))).await;
    assert_eq!(resp.status, 400);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:badCSR");

    let resp = h.post(&client, &finalize, Some(json!({"csr": b64(&csr(&key, &["a.com", "b.com", "c.com"]))}))).await;
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:badCSR");

    let order = json_body(&h.post(&client, &order_url, None).await);
    assert_eq!(order["status"], "ready");
}

#[tokio::test]
async fn finalize_before_ready_is_rejected() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "a.com"}]
    }))).await;
    let finalize = json_body(&resp)["finalize"].as_str().unwrap().to_string();
    let resp = h.post(&client, &finalize, Some(json!({"csr": b64(&csr(&p256(), &["a.com"]))}))).await;
    assert_eq!(resp.status, 403);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:orderNotReady");
}

#[tokio::test]
async fn nonces_are_single_use() {
    let (mut h, _) = Harness::new().await;
    let client = AcmeClient { key: p256(), kid: None };
    let nonce = h.fresh_nonce().await;
    let url = format!("{}newAccount", BASE_URL);
    let jws = sign_jws(
        &client.key,
        json!({"alg": "ES256", "nonce": nonce, "url": url, "jwk": jwk(&client.key)}),
        &json!({"termsOfServiceAgreed": true}).to_string(),
    );

    let resp = h.post_jws(&url, jws.clone()).await;
    assert_eq!(resp.status, 201);
    let resp = h.post_jws(&url, jws).await;
    assert_eq!(resp.status, 400);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:badNonce");
    assert!(resp.header("Replay-Nonce").is_some());
}

#[tokio::test]
async fn key_change_rolls_over_and_detects_conflicts() {
    let (mut h, _) = Harness::new().await;
    let alice = h.new_account().await;
    let bob = h.new_account().await;
    let url = format!("{}keyChange", BASE_URL);

    let inner = |new_key: &PKey<Private>, old: &AcmeClient| sign_jws(
        new_key,
        json!({"alg": "ES256", "url": url, "jwk": jwk(new_key)}),
        &json!({"account": old.kid, "oldKey": jwk(&old.key)}).to_string(),
    );

    let resp = h.post(&alice, &url, Some(inner(&bob.key, &alice))).await;
    assert_eq!(resp.status, 409);
    assert!(resp.body.is_empty());
    assert_eq!(resp.header("Location"), bob.kid.as_deref());

    let new_key = p256();
    let resp = h.post(&alice, &url, Some(inner(&new_key, &alice))).await;
    assert_eq!(resp.status, 200);

    let stale = h.post(&alice, alice.kid.as_deref().unwrap(), None).await;
    assert_eq!(problem_type(&stale), "urn:ietf:params:acme:error:malformed");
    let rolled = AcmeClient { key: new_key, kid: alice.kid.clone() };
    let resp = h.post(&rolled, alice.kid.as_deref().unwrap(), None).await;
    assert_eq!(resp.status, 200);
    assert_eq!(json_body(&resp)["status"], "valid");
}

#[tokio::test]
async fn deactivated_accounts_are_locked_out() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let kid = client.kid.clone().unwrap();
    let resp = h.post(&client, &kid, Some(json!({"status": "deactivated"}))).await;
    assert_eq!(json_body(&resp)["status"], "deactivated");

    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "a.com"}]
    }))).await;
    assert_eq!(resp.status, 401);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:unauthorized");
}

#[tokio::test]
async fn padded_jwk_finds_existing_account() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let mut padded = jwk(&client.key);
    let mut x = vec![0];
    x.extend(BASE64_URL_SAFE_NO_PAD.decode(padded["x"].as_str().unwrap()).unwrap());
    padded["x"] = json!(b64(&x));

    let url = format!("{}newAccount", BASE_URL);
    let nonce = h.fresh_nonce().await;
    let jws = sign_jws(
        &client.key,
        json!({"alg": "ES256", "nonce": nonce, "url": url, "jwk": padded}),
        &json!({"termsOfServiceAgreed": true}).to_string(),
    );
    let resp = h.post_jws(&url, jws).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Location"), client.kid.as_deref());
}

#[tokio::test]
async fn certificate_key_can_revoke() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let (leaf, cert_key) = h.issue(&client, &["revoke.example.com"]).await;
    let revoke = json!({"certificate": b64(&leaf.to_der().unwrap())});
    let url = format!("{}revokeCert", BASE_URL);

    let stranger = AcmeClient { key: p256(), kid: None };
    let resp = h.post(&stranger, &url, Some(revoke.clone())).await;
    assert_eq!(resp.status, 400);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:unauthorized");

    let other_account = h.new_account().await;
    let resp = h.post(&other_account, &url, Some(revoke.clone())).await;
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:unauthorized");

    let holder = AcmeClient { key: cert_key, kid: None };
    let resp = h.post(&holder, &url, Some(revoke)).await;
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn wildcard_orders_offer_only_dns() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "*.example.com"}]
    }))).await;
    assert_eq!(resp.status, 201);
    let order = json_body(&resp);
    assert_eq!(order["identifiers"][0]["value"], "*.example.com");

    let authz = json_body(&h.post(&client, order["authorizations"][0].as_str().unwrap(), None).await);
    assert_eq!(authz["identifier"]["value"], "example.com");
    assert_eq!(authz["wildcard"], true);
    let types: Vec<&str> = authz["challenges"].as_array().unwrap().iter()
        .map(|c| c["type"].as_str().unwrap()).collect();
    assert_eq!(types, vec!["dns-01"]);

    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "*.*.example.com"}]
    }))).await;
    assert_eq!(resp.status, 400);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:unsupportedIdentifier");
}

#[tokio::test]
async fn deactivated_authorization_invalidates_order() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "a.com"}, {"type": "dns", "value": "b.com"}]
    }))).await;
    let order_url = resp.header("Location").unwrap().to_string();
    let authz_url = json_body(&resp)["authorizations"][0].as_str().unwrap().to_string();

    let resp = h.post(&client, &authz_url, Some(json!({"status": "deactivated"}))).await;
    assert_eq!(resp.status, 200);
    assert_eq!(json_body(&resp)["status"], "deactivated");
    let order = json_body(&h.post(&client, &order_url, None).await);
    assert_eq!(order["status"], "invalid");

    let resp = h.post(&client, &authz_url, Some(json!({"status": "valid"}))).await;
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:malformed");
}

#[tokio::test]
async fn account_lists_its_orders() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let other = h.new_account().await;
    let resp = h.post(&client, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "listed.example.com"}]
    }))).await;
    let order_url = resp.header("Location").unwrap().to_string();

    let account = json_body(&h.post(&client, client.kid.as_deref().unwrap(), None).await);
    let orders_url = account["orders"].as_str().unwrap().to_string();
    let resp = h.post(&client, &orders_url, None).await;
    assert_eq!(resp.status, 200);
    assert_eq!(json_body(&resp)["orders"], json!([order_url]));

    let resp = h.post(&other, &orders_url, None).await;
    assert_eq!(resp.status, 404);
}

#[tokio::test]
async fn certificate_before_issuance_is_not_ready() {
    let (mut h, _) = Harness::new().await;
    let client = h.new_account().await;
    let (order_url, order) = h.ready_order(&client, &["early.example.com"]).await;
    assert!(order.get("certificate").is_none());

    let order_id = order_url.rsplit('/').next().unwrap();
    let resp = h.post(&client, &format!("{}cert/{}", BASE_URL, order_id), None).await;
    assert_eq!(resp.status, 404);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:orderNotReady");
}

#[tokio::test]
async fn unknown_kid_does_not_exist() {
    let (mut h, _) = Harness::new().await;
    let ghost = AcmeClient { key: p256(), kid: Some(format!("{}acct/AAAAAAAAAAA", BASE_URL)) };
    let resp = h.post(&ghost, &format!("{}newOrder", BASE_URL), Some(json!({
        "identifiers": [{"type": "dns", "value": "a.com"}]
    }))).await;
    assert_eq!(resp.status, 400);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:accountDoesNotExist");
}

#[tokio::test]
async fn key_change_checks_inner_payload() {
    let (mut h, _) = Harness::new().await;
    let alice = h.new_account().await;
    let bob = h.new_account().await;
    let url = format!("{}keyChange", BASE_URL);
    let new_key = p256();
    let inner = |account: &Option<String>, old_key: &PKey<Private>| sign_jws(
        &new_key,
        json!({"alg": "ES256", "url": url, "jwk": jwk(&new_key)}),
        &json!({"account": account, "oldKey": jwk(old_key)}).to_string(),
    );

    let resp = h.post(&alice, &url, Some(inner(&bob.kid, &alice.key))).await;
    assert_eq!(resp.status, 400);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:malformed");

    let resp = h.post(&alice, &url, Some(inner(&alice.kid, &bob.key))).await;
    assert_eq!(resp.status, 400);
    assert_eq!(problem_type(&resp), "urn:ietf:params:acme:error:malformed");

    let resp = h.post(&alice, alice.kid.as_deref().unwrap(), None).await;
    assert_eq!(resp.status, 200, "a refused key change must leave the old key in place");
}
