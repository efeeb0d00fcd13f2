//! Structural checks on a finalize CSR before it is handed to the signing authority.

use std::collections::HashSet;
use foreign_types::ForeignTypeRef;
use crate::types;

pub const OID_RSA: &str = "1.2.840.113549.1.1.1";
pub const OID_RSA_PSS: &str = "1.2.840.113549.1.1.10";
pub const OID_EC: &str = "1.2.840.10045.2.1";
pub const OID_ED25519: &str = "1.3.101.112";
pub const OID_ED448: &str = "1.3.101.113";

/// `EVP_PKEY_RSA_PSS`, equal to `NID_rsassaPss`.
const EVP_PKEY_RSA_PSS: libc::c_int = 912;

/// The CA and profile a CSR will be enrolled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ca: String,
    pub profile: String,
}

fn bad_csr<D: ToString>(detail: D) -> types::error::Error {
    crate::problem!(BadCSR, 400, "Invalid CSR", detail)
}

struct GeneralName(openssl::x509::GeneralName);

impl GeneralName {
    fn from_der(der: &[u8]) -> Result<Self, openssl::error::ErrorStack> {
        unsafe {
            openssl_sys::init();
            let len = std::cmp::min(der.len(), libc::c_long::MAX as usize) as libc::c_long;
            Ok(Self(foreign_types::ForeignType::from_ptr(
                crate::util::cvt_p(d2i_GENERAL_NAME(std::ptr::null_mut(), &mut der.as_ptr(), len))?
            )))
        }
    }
}

fn key_algorithm_oid(key: &openssl::pkey::PKeyRef<openssl::pkey::Public>) -> Option<&'static str> {
    match key.id() {
        openssl::pkey::Id::RSA => Some(OID_RSA),
        openssl::pkey::Id::EC => Some(OID_EC),
        openssl::pkey::Id::ED25519 => Some(OID_ED25519),
        openssl::pkey::Id::ED448 => Some(OID_ED448),
        id if id.as_raw() == EVP_PKEY_RSA_PSS => Some(OID_RSA_PSS),
        _ => None,
    }
}

/// Raw DER of the subjectAltName extension, if the CSR requests one.
fn san_extension_data(req: &openssl::x509::X509ReqRef) -> Result<Option<Vec<u8>>, openssl::error::ErrorStack> {
    let extensions = match req.extensions() {
        Ok(e) => e,
        // A CSR without an extension request attribute.
        Err(_) => return Ok(None),
    };
    for ext in extensions.iter() {
        unsafe {
            let obj = X509_EXTENSION_get_object(ext.as_ptr());
            if openssl_sys::OBJ_obj2nid(obj) != openssl::nid::Nid::SUBJECT_ALT_NAME.as_raw() {
                continue;
            }
            let data = openssl_sys::X509_EXTENSION_get_data(ext.as_ptr()) as *const openssl_sys::ASN1_STRING;
            let bytes = std::slice::from_raw_parts(
                openssl_sys::ASN1_STRING_get0_data(data),
                openssl_sys::ASN1_STRING_length(data) as usize,
            );
            return Ok(Some(bytes.to_vec()));
        }
    }
    Ok(None)
}

fn san_dns_names(san_der: &[u8]) -> super::ACMEResult<Vec<String>> {
    let names = asn1::parse_single::<asn1::SequenceOf<asn1::Tlv>>(san_der)
        .map_err(|_| bad_csr("could not parse subjectAltName extension"))?;
    let mut dns_names = vec![];
    for name in names {
        let name = GeneralName::from_der(name.full_data())
            .map_err(|_| bad_csr("could not parse subjectAltName extension"))?;
        match name.0.dnsname() {
            Some(d) => dns_names.push(d.to_ascii_lowercase()),
            None => return Err(bad_csr("subjectAltName may only contain DNS names")),
        }
    }
    Ok(dns_names)
}

/// Validates a CSR against the order's identifiers and picks the CA profile for its key.
///
/// The key algorithm must be accepted by a configured profile, a subject CN must name one
/// of the identifiers, the SAN set must equal the identifier set, and the self-signature
/// must verify.
pub fn check_csr(
    der: &[u8], identifiers: &[types::identifier::Identifier], profiles: &[crate::config::CaProfile],
) -> super::ACMEResult<Target> {
    let req = openssl::x509::X509Req::from_der(der).map_err(|_| bad_csr("could not parse CSR"))?;
    let key = req.public_key().map_err(|_| bad_csr("could not parse CSR public key"))?;

    let key_oid = key_algorithm_oid(&key).ok_or_else(|| bad_csr("unsupported public key algorithm"))?;
    let profile = profiles.iter()
        .find(|p| p.key_types.iter().any(|k| k == key_oid))
        .ok_or_else(|| bad_csr(format!("no CA profile accepts public key algorithm {}", key_oid)))?;

    let wanted: HashSet<String> = identifiers.iter()
        .filter(|i| i.id_type == "dns")
        .map(|i| i.value.to_ascii_lowercase())
        .collect();

    for cn in req.subject_name().entries_by_nid(openssl::nid::Nid::COMMONNAME) {
        let cn = cn.data().as_utf8().map_err(|_| bad_csr("could not decode subject common name"))?;
        if !wanted.contains(&cn.to_string().to_ascii_lowercase()) {
            return Err(bad_csr(format!("common name '{}' is not an identifier of the order", cn)));
        }
    }

    let san_der = san_extension_data(&req)
        .map_err(|_| bad_csr("could not read CSR extensions"))?
        .ok_or_else(|| bad_csr("CSR has no subjectAltName extension"))?;
    let requested: HashSet<String> = san_dns_names(&san_der)?.into_iter().collect();

    let mut missing: Vec<&String> = wanted.difference(&requested).collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(bad_csr(format!("CSR does not contain identifiers {:?}", missing)));
    }
    let mut extra: Vec<&String> = requested.difference(&wanted).collect();
    if !extra.is_empty() {
        extra.sort();
        return Err(bad_csr(format!("CSR contains identifiers {:?} not in the order", extra)));
    }

    match req.verify(&key) {
        Ok(true) => {}
        _ => return Err(bad_csr("CSR signature does not verify")),
    }

    Ok(Target {
        ca: profile.ca.clone(),
        profile: profile.tls_profile.clone(),
    })
}

extern "C" {
    fn d2i_GENERAL_NAME(
        a: *mut *mut openssl_sys::GENERAL_NAME,
        pp: *mut *const libc::c_uchar,
        length: libc::c_long,
    ) -> *mut openssl_sys::GENERAL_NAME;

    fn X509_EXTENSION_get_object(ex: *mut openssl_sys::X509_EXTENSION) -> *mut openssl_sys::ASN1_OBJECT;
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::{PKey, Private};

    fn ec_key() -> PKey<Private> {
        let group = openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap()
    }

    fn make_csr(key: &PKey<Private>, cn: Option<&str>, sans: &[&str]) -> Vec<u8> {
        let mut builder = openssl::x509::X509ReqBuilder::new().unwrap();
        builder.set_pubkey(key).unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        if let Some(cn) = cn {
            name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, cn).unwrap();
        }
        builder.set_subject_name(&name.build()).unwrap();
        if !sans.is_empty() {
            let ext = {
                let ctx = builder.x509v3_context(None);
                let mut san = openssl::x509::extension::SubjectAlternativeName::new();
                for s in sans {
                    san.dns(s);
                }
                san.build(&ctx).unwrap()
            };
            let mut stack = openssl::stack::Stack::new().unwrap();
            stack.push(ext).unwrap();
            builder.add_extensions(&stack).unwrap();
        }
        builder.sign(key, openssl::hash::MessageDigest::sha256()).unwrap();
        builder.build().to_der().unwrap()
    }

    fn profiles() -> Vec<crate::config::CaProfile> {
        vec![
            crate::config::CaProfile {
                ca: "rsa-ca".to_string(),
                tls_profile: "tls-rsa".to_string(),
                key_types: vec![OID_RSA.to_string()],
            },
            crate::config::CaProfile {
                ca: "ec-ca".to_string(),
                tls_profile: "tls-ec".to_string(),
                key_types: vec![OID_EC.to_string(), OID_ED25519.to_string()],
            },
        ]
    }

    fn ids(values: &[&str]) -> Vec<types::identifier::Identifier> {
        values.iter().map(|v| types::identifier::Identifier::dns(v)).collect()
    }

    #[test]
    fn matching_csr_selects_profile() {
        let key = ec_key();
        let csr = make_csr(&key, Some("a.com"), &["a.com", "b.com"]);
        let target = check_csr(&csr, &ids(&["a.com", "b.com"]), &profiles()).unwrap();
        assert_eq!(target, Target { ca: "ec-ca".to_string(), profile: "tls-ec".to_string() });
    }

    #[test]
    fn missing_identifier_is_rejected() {
        let csr = make_csr(&ec_key(), None, &["a.com"]);
        let err = check_csr(&csr, &ids(&["a.com", "b.com"]), &profiles()).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::BadCSR);
        assert!(err.detail.contains("b.com"));
    }

    #[test]
    fn extra_identifier_is_rejected() {
        let csr = make_csr(&ec_key(), None, &["a.com", "b.com", "c.com"]);
        let err = check_csr(&csr, &ids(&["a.com", "b.com"]), &profiles()).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::BadCSR);
        assert!(err.detail.contains("c.com"));
    }

    #[test]
    fn foreign_common_name_is_rejected() {
        let csr = make_csr(&ec_key(), Some("evil.com"), &["a.com"]);
        let err = check_csr(&csr, &ids(&["a.com"]), &profiles()).unwrap_err();
        assert!(err.detail.contains("evil.com"));
    }

    #[test]
    fn csr_without_san_is_rejected() {
        let csr = make_csr(&ec_key(), Some("a.com"), &[]);
        let err = check_csr(&csr, &ids(&["a.com"]), &profiles()).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::BadCSR);
    }

    #[test]
    fn unconfigured_key_type_is_rejected() {
        let csr = make_csr(&ec_key(), None, &["a.com"]);
        let only_rsa = vec![profiles().remove(0)];
        let err = check_csr(&csr, &ids(&["a.com"]), &only_rsa).unwrap_err();
        assert!(err.detail.contains(OID_EC));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = check_csr(b"not a csr", &ids(&["a.com"]), &profiles()).unwrap_err();
        assert_eq!(err.detail, "could not parse CSR");
    }
}
