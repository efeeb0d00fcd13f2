use base64::prelude::*;
use foreign_types::ForeignTypeRef;
use crate::types;

pub mod worker;

const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";
const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Result of a single proof check against a client's infrastructure.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Valid,
    /// The client answered, but wrongly. The challenge fails for good.
    Invalid(types::error::Error),
    /// The check could not be completed and may be retried on a later pass.
    Transient(String),
}

#[async_trait::async_trait]
pub trait ChallengeProbe: Send + Sync {
    /// `expected` is the key authorization for http-01 and its base64url SHA-256 digest otherwise.
    async fn probe(
        &self, challenge_type: types::challenge::Type, domain: &str, token: &str, expected: &str,
    ) -> ProbeOutcome;
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("unable to read DNS config: {0}")]
    Resolver(#[from] trust_dns_resolver::error::ResolveError),
    #[error("unable to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

fn incorrect<D: ToString>(title: &str, detail: D) -> ProbeOutcome {
    ProbeOutcome::Invalid(crate::problem!(IncorrectResponse, 400, title, detail))
}

/// Probes challenges over the network: HTTP for http-01, DNS for dns-01, TLS for tls-alpn-01.
pub struct Validator {
    dns_resolver: trust_dns_resolver::TokioAsyncResolver,
    reqwest_client: reqwest::Client,
    http_port: u16,
    tls_port: u16,
}

impl Validator {
    pub fn new() -> Result<Validator, ValidatorError> {
        let resolver = trust_dns_resolver::AsyncResolver::tokio_from_system_conf()?;
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .referer(true)
            .no_proxy()
            .build()?;

        Ok(Validator {
            dns_resolver: resolver,
            reqwest_client: client,
            http_port: 80,
            tls_port: 443,
        })
    }

    /// Overrides the ports probed for http-01 and tls-alpn-01.
    pub fn with_ports(mut self, http_port: u16, tls_port: u16) -> Self {
        self.http_port = http_port;
        self.tls_port = tls_port;
        self
    }

    async fn validate_http01(&self, domain: &str, token: &str, key_auth: &str) -> ProbeOutcome {
        let test_uri = format!("http://{}:{}/.well-known/acme-challenge/{}", domain, self.http_port, token);
        let test_uri = match reqwest::Url::parse(&test_uri) {
            Ok(u) => u,
            Err(_) => return ProbeOutcome::Invalid(crate::problem!(
                Malformed, 400, "Validation failed", format!("Invalid URI {}", test_uri)
            )),
        };

        let resp = match self.reqwest_client.get(test_uri).send().await {
            Ok(r) => r,
            Err(err) => {
                return if err.is_timeout() {
                    ProbeOutcome::Transient(format!("Connection to {} timed out", domain))
                } else if err.is_connect() {
                    ProbeOutcome::Transient(format!("Connection to {} refused", domain))
                } else if err.is_redirect() {
                    ProbeOutcome::Transient(format!("Too many redirects from {}", domain))
                } else {
                    ProbeOutcome::Invalid(crate::problem!(
                        Connection, 400, "Validation failed", format!("Request to {} failed: {}", domain, err)
                    ))
                };
            }
        };
        if !resp.status().is_success() {
            return incorrect("Validation failed", format!("HTTP {} received", resp.status().as_str()));
        }
        let resp_txt = match resp.text().await {
            Ok(t) => t.trim().to_string(),
            Err(_) => return incorrect("Validation failed", "Text charset error"),
        };

        if resp_txt == key_auth {
            ProbeOutcome::Valid
        } else {
            incorrect("Validation failed", format!("Expected '{}', received '{}'", key_auth, resp_txt))
        }
    }

    async fn validate_dns01(&self, domain: &str, key_auth_hash: &str) -> ProbeOutcome {
        let search_domain = format!("_acme-challenge.{}.", domain.trim_end_matches('.'));
        match self.dns_resolver.txt_lookup(search_domain.clone()).await {
            Ok(r) => {
                for record in r.iter() {
                    let txt_data = record.txt_data().iter()
                        .flat_map(|d| d.iter().copied())
                        .collect::<Vec<u8>>();
                    if txt_data == key_auth_hash.as_bytes() {
                        return ProbeOutcome::Valid;
                    }
                }
                incorrect(
                    "Validation failed",
                    format!("No TXT records found for {} with the value '{}'", search_domain, key_auth_hash),
                )
            }
            Err(err) => match err.kind() {
                trust_dns_resolver::error::ResolveErrorKind::NoRecordsFound { .. } => ProbeOutcome::Invalid(
                    crate::problem!(DNS, 400, "Validation failed", format!("No TXT records found for {}", search_domain))
                ),
                _ => ProbeOutcome::Transient(format!("SERVFAIL whilst getting records for {}: {}", search_domain, err)),
            }
        }
    }

    async fn validate_tlsalpn01(&self, domain: &str, key_auth_hash: &str) -> ProbeOutcome {
        let expected_digest = match BASE64_URL_SAFE_NO_PAD.decode(key_auth_hash) {
            Ok(d) => d,
            Err(_) => return ProbeOutcome::Transient("stored key authorization digest is not base64url".to_string()),
        };
        let connection_string = format!("{}:{}", domain, self.tls_port);
        let sni_string = domain.to_ascii_lowercase();

        let mut ssl_ctx_builder = match openssl::ssl::SslContext::builder(openssl::ssl::SslMethod::tls_client()) {
            Ok(b) => b,
            Err(err) => {
                error!("Failed to create SSL context builder: {}", err);
                return ProbeOutcome::Transient("failed to create SSL context".to_string());
            }
        };
        ssl_ctx_builder.set_verify(openssl::ssl::SslVerifyMode::NONE);
        let configured = ssl_ctx_builder.set_min_proto_version(Some(openssl::ssl::SslVersion::TLS1_2))
            .and_then(|_| ssl_ctx_builder.set_alpn_protos(b"\x0aacme-tls/1"));
        if let Err(err) = configured {
            error!("Failed to configure SSL context: {}", err);
            return ProbeOutcome::Transient("failed to configure SSL context".to_string());
        }
        let ssl_ctx = ssl_ctx_builder.build();

        let tcp_stream = match tokio::net::TcpStream::connect(&connection_string).await {
            Ok(s) => s,
            Err(_) => return ProbeOutcome::Transient(format!("Failed to open TCP connection to {}", connection_string)),
        };

        let mut ssl_session = match openssl::ssl::Ssl::new(&ssl_ctx) {
            Ok(s) => s,
            Err(err) => {
                error!("Failed to create SSL session: {}", err);
                return ProbeOutcome::Transient("failed to create SSL session".to_string());
            }
        };
        if ssl_session.set_hostname(&sni_string).is_err() {
            return ProbeOutcome::Invalid(crate::problem!(
                Malformed, 400, "Validation failed", format!("'{}' cannot be sent as SNI", sni_string)
            ));
        }
        let mut ssl_stream = match tokio_openssl::SslStream::new(ssl_session, tcp_stream) {
            Ok(s) => s,
            Err(err) => {
                error!("Failed to create SSL stream: {}", err);
                return ProbeOutcome::Transient("failed to create SSL stream".to_string());
            }
        };
        if std::pin::Pin::new(&mut ssl_stream).connect().await.is_err() {
            return ProbeOutcome::Transient(format!("Failed to negotiate TLS connection with {}", connection_string));
        }

        let ssl_session_ref = ssl_stream.ssl();
        if ssl_session_ref.selected_alpn_protocol() != Some(ACME_TLS_ALPN) {
            return ProbeOutcome::Invalid(crate::problem!(
                TLS, 400, "ALPN failed", "Server did not negotiate \"acme-tls/1\" protocol"
            ));
        }
        let peer_certificate = match ssl_session_ref.peer_certificate() {
            Some(c) => c,
            None => return incorrect("No certificate", "Server did not return a self signed certificate"),
        };

        match check_validation_certificate(&peer_certificate, &sni_string, &expected_digest) {
            Ok(()) => ProbeOutcome::Valid,
            Err(err) => ProbeOutcome::Invalid(err),
        }
    }
}

#[async_trait::async_trait]
impl ChallengeProbe for Validator {
    async fn probe(
        &self, challenge_type: types::challenge::Type, domain: &str, token: &str, expected: &str,
    ) -> ProbeOutcome {
        debug!("Probing {} for {}", challenge_type.as_str(), domain);
        match challenge_type {
            types::challenge::Type::HTTP01 => self.validate_http01(domain, token, expected).await,
            types::challenge::Type::DNS01 => self.validate_dns01(domain, expected).await,
            types::challenge::Type::TLSALPN01 => self.validate_tlsalpn01(domain, expected).await,
        }
    }
}

/// Checks the self-signed certificate presented for tls-alpn-01.
///
/// It must carry exactly one SAN, a dNSName equal to `domain`, and a critical
/// acmeIdentifier extension wrapping `expected_digest` in an OCTET STRING.
pub fn check_validation_certificate(
    cert: &openssl::x509::X509Ref, domain: &str, expected_digest: &[u8],
) -> Result<(), types::error::Error> {
    let invalid = |title: &str, detail: String| crate::problem!(IncorrectResponse, 400, title, detail);

    let subject_alt_names = cert.subject_alt_names()
        .ok_or_else(|| invalid("No SANs", "Server did not return a SAN in its self signed certificate".to_string()))?;
    if subject_alt_names.len() != 1 {
        return Err(invalid(
            "Invalid SANs", "Server did not return only one SAN in its self signed certificate".to_string(),
        ));
    }
    let domain_alt_name = subject_alt_names.iter().next()
        .and_then(|n| n.dnsname())
        .ok_or_else(|| invalid(
            "Invalid SANs", "Server did not return a domain SAN in its self signed certificate".to_string(),
        ))?;
    if !domain_alt_name.eq_ignore_ascii_case(domain) {
        return Err(invalid("Invalid SANs", format!(
            "Server returned a SAN for '{}' in its self signed certificate, expected '{}'", domain_alt_name, domain
        )));
    }

    let acme_identifier_oid = openssl::asn1::Asn1Object::from_str(ACME_IDENTIFIER_OID).map_err(|err| {
        error!("Unable to build acmeIdentifier OID: {}", err);
        crate::internal_server_error!()
    })?;

    let ext_data = unsafe {
        let extensions = openssl_sys::X509_get0_extensions(cert.as_ptr());
        let acme_id_idx = X509v3_get_ext_by_OBJ(extensions, acme_identifier_oid.as_ptr(), -1);
        if acme_id_idx < 0 {
            return Err(invalid(
                "No acmeIdentifier extension",
                "Server did not return an acmeIdentifier with the key authorization in its self signed certificate".to_string(),
            ));
        }
        let acme_id_ext = openssl_sys::X509v3_get_ext(extensions, acme_id_idx);
        if openssl_sys::X509_EXTENSION_get_critical(acme_id_ext) != 1 {
            return Err(invalid(
                "Invalid acmeIdentifier extension",
                "Server returned a non critical acmeIdentifier extension in its self signed certificate".to_string(),
            ));
        }
        let data = openssl_sys::X509_EXTENSION_get_data(acme_id_ext) as *const openssl_sys::ASN1_STRING;
        std::slice::from_raw_parts(
            openssl_sys::ASN1_STRING_get0_data(data),
            openssl_sys::ASN1_STRING_length(data) as usize,
        ).to_vec()
    };

    let acme_id_data = asn1::parse_single::<&[u8]>(&ext_data).map_err(|_| invalid(
        "Invalid acmeIdentifier extension",
        "Server returned an un-parsable acmeIdentifier extension in its self signed certificate".to_string(),
    ))?;
    if acme_id_data != expected_digest {
        return Err(invalid(
            "Invalid acmeIdentifier extension",
            format!("Server returned '{:X?}', expected '{:X?}'", acme_id_data, expected_digest),
        ));
    }
    Ok(())
}

extern "C" {
    fn X509v3_get_ext_by_OBJ(
        x: *const openssl_sys::stack_st_X509_EXTENSION,
        obj: *const openssl_sys::ASN1_OBJECT,
        lastpos: libc::c_int,
    ) -> libc::c_int;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn validation_cert(sans: &[&str], acme_ext: Option<(&[u8], bool)>) -> openssl::x509::X509 {
        let group = openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
        let key = openssl::pkey::PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap();
        let mut builder = openssl::x509::X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&openssl::asn1::Asn1Time::days_from_now(1).unwrap()).unwrap();
        if !sans.is_empty() {
            let mut san = openssl::x509::extension::SubjectAlternativeName::new();
            for s in sans {
                san.dns(s);
            }
            let ext = san.build(&builder.x509v3_context(None, None)).unwrap();
            builder.append_extension(ext).unwrap();
        }
        if let Some((digest, critical)) = acme_ext {
            let mut der = vec![0x04, digest.len() as u8];
            der.extend_from_slice(digest);
            let value = format!(
                "{}DER:{}", if critical { "critical," } else { "" }, hex::encode(der)
            );
            let ext = {
                let ctx = builder.x509v3_context(None, None);
                #[allow(deprecated)]
                openssl::x509::X509Extension::new(None, Some(&ctx), ACME_IDENTIFIER_OID, &value).unwrap()
            };
            builder.append_extension(ext).unwrap();
        }
        builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
        builder.build()
    }

    fn digest() -> Vec<u8> {
        openssl::hash::hash(openssl::hash::MessageDigest::sha256(), b"token.thumbprint").unwrap().to_vec()
    }

    #[test]
    fn accepts_well_formed_certificate() {
        let cert = validation_cert(&["example.com"], Some((&digest(), true)));
        check_validation_certificate(&cert, "example.com", &digest()).unwrap();
    }

    #[test]
    fn rejects_wrong_digest() {
        let cert = validation_cert(&["example.com"], Some((&[0u8; 32], true)));
        let err = check_validation_certificate(&cert, "example.com", &digest()).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::IncorrectResponse);
        assert_eq!(err.title, "Invalid acmeIdentifier extension");
    }

    #[test]
    fn rejects_non_critical_extension() {
        let cert = validation_cert(&["example.com"], Some((&digest(), false)));
        let err = check_validation_certificate(&cert, "example.com", &digest()).unwrap_err();
        assert!(err.detail.contains("non critical"));
    }

    #[test]
    fn rejects_missing_extension() {
        let cert = validation_cert(&["example.com"], None);
        let err = check_validation_certificate(&cert, "example.com", &digest()).unwrap_err();
        assert_eq!(err.title, "No acmeIdentifier extension");
    }

    #[test]
    fn rejects_san_mismatch() {
        let cert = validation_cert(&["other.com"], Some((&digest(), true)));
        assert_eq!(
            check_validation_certificate(&cert, "example.com", &digest()).unwrap_err().title,
            "Invalid SANs"
        );
        let cert = validation_cert(&["example.com", "www.example.com"], Some((&digest(), true)));
        assert!(check_validation_certificate(&cert, "example.com", &digest()).is_err());
    }

    /// Serves one HTTP response on an ephemeral port and returns the port.
    async fn serve_once(status: &'static str, body: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
                status, body.len(), body
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
        });
        port
    }

    #[tokio::test]
    async fn http01_matching_body_is_valid() {
        let port = serve_once("200 OK", "token.thumbprint\n").await;
        let validator = Validator::new().unwrap().with_ports(port, 443);
        let outcome = validator.probe(types::challenge::Type::HTTP01, "127.0.0.1", "token", "token.thumbprint").await;
        assert_eq!(outcome, ProbeOutcome::Valid);
    }

    #[tokio::test]
    async fn http01_wrong_body_is_invalid() {
        let port = serve_once("200 OK", "something else").await;
        let validator = Validator::new().unwrap().with_ports(port, 443);
        match validator.probe(types::challenge::Type::HTTP01, "127.0.0.1", "token", "token.thumbprint").await {
            ProbeOutcome::Invalid(err) => assert_eq!(err.error_type, types::error::Type::IncorrectResponse),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn http01_not_found_is_invalid() {
        let port = serve_once("404 Not Found", "").await;
        let validator = Validator::new().unwrap().with_ports(port, 443);
        match validator.probe(types::challenge::Type::HTTP01, "127.0.0.1", "token", "token.thumbprint").await {
            ProbeOutcome::Invalid(err) => assert_eq!(err.detail, "HTTP 404 received"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn refused_connections_are_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let validator = Validator::new().unwrap().with_ports(port, port);
        assert!(matches!(
            validator.probe(types::challenge::Type::HTTP01, "127.0.0.1", "token", "token.thumbprint").await,
            ProbeOutcome::Transient(_)
        ));
        let digest = BASE64_URL_SAFE_NO_PAD.encode(digest());
        assert!(matches!(
            validator.probe(types::challenge::Type::TLSALPN01, "127.0.0.1", "token", &digest).await,
            ProbeOutcome::Transient(_)
        ));
    }
}
