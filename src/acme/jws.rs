use std::convert::{TryFrom, TryInto};
use base64::prelude::*;
use crate::types::jose::{FlattenedJWS, JWSProtectedHeader, JWK};
use super::ACMEResult;

pub fn parse_flattened_jws(body: &[u8]) -> ACMEResult<FlattenedJWS> {
    serde_json::from_slice::<FlattenedJWS>(body).map_err(|err| crate::problem!(
        Malformed, 400, "Invalid JWS", format!("Invalid JWS received in body: '{}'", err)
    ))
}

/// Decodes the envelope, returning the protected header, payload and signature bytes.
pub fn start_decode_jws(jws: &FlattenedJWS) -> ACMEResult<(JWSProtectedHeader, Vec<u8>, Vec<u8>)> {
    let header_bytes = BASE64_URL_SAFE_NO_PAD.decode(&jws.protected).map_err(|err| crate::problem!(
        Malformed, 400, "Invalid JWS", format!("Invalid JWS header: '{}'", err)
    ))?;
    let signature_bytes = BASE64_URL_SAFE_NO_PAD.decode(&jws.signature).map_err(|err| crate::problem!(
        Malformed, 400, "Invalid JWS", format!("Invalid JWS signature: '{}'", err)
    ))?;
    let payload_bytes = BASE64_URL_SAFE_NO_PAD.decode(&jws.payload).map_err(|err| crate::problem!(
        Malformed, 400, "Invalid JWS", format!("Invalid JWS payload: '{}'", err)
    ))?;

    let header = serde_json::from_slice::<JWSProtectedHeader>(&header_bytes).map_err(|err| crate::problem!(
        Malformed, 400, "Invalid JWS", format!("Invalid JWS header: '{}'", err)
    ))?;

    let crit_vals = header.crit.as_deref().unwrap_or_default();
    if !crit_vals.is_empty() {
        return Err(crate::problem!(
            Malformed, 400, "Invalid JWS", format!("Unsupported critical constraints: {:?}", crit_vals)
        ));
    }

    let is_b64 = header.b64.unwrap_or(true);
    if !is_b64 {
        return Err(crate::problem!(Malformed, 400, "Invalid JWS", "Unencoded payload not supported"));
    }

    Ok((header, payload_bytes, signature_bytes))
}

pub fn jwk_to_key(jwk: &JWK) -> ACMEResult<openssl::pkey::PKey<openssl::pkey::Public>> {
    jwk.try_into().map_err(|err: String| crate::problem!(BadPublicKey, 400, "Invalid public key", err))
}

/// Canonical JWK members of a parsed key.
///
/// Built from the key rather than from the client's JWK so that one key always has one
/// thumbprint, however its numbers were padded on the wire.
pub fn canonical_jwk(
    key: &openssl::pkey::PKey<openssl::pkey::Public>,
) -> ACMEResult<std::collections::BTreeMap<String, String>> {
    JWK::try_from(key)
        .and_then(|jwk| jwk.canonical())
        .map_err(|err| crate::problem!(BadPublicKey, 400, "Invalid public key", err))
}

fn bad_algorithm(alg: &str) -> crate::types::error::Error {
    crate::problem!(
        BadSignatureAlgorithm, 400, "Invalid JWS",
        format!("'{}' is not an appropriate algorithm for the given key", alg)
    )
}

fn invalid_signature() -> crate::types::error::Error {
    crate::problem!(Malformed, 400, "Invalid JWS signature", "The JWS signature does not verify")
}

/// Verifies the signature over `protected.payload` with `key`.
pub fn verify_jws_sig(
    jws: &FlattenedJWS, header: &JWSProtectedHeader, signature_bytes: &[u8],
    key: &openssl::pkey::PKeyRef<openssl::pkey::Public>,
) -> ACMEResult<()> {
    let to_verify = format!("{}.{}", jws.protected, jws.payload);
    let alg = header.alg.as_str();

    let verified = match alg {
        "RS256" | "RS384" | "RS512" | "PS256" | "PS384" | "PS512" => {
            if key.id() != openssl::pkey::Id::RSA {
                return Err(bad_algorithm(alg));
            }
            let msg_digest = match &alg[2..] {
                "256" => openssl::hash::MessageDigest::sha256(),
                "384" => openssl::hash::MessageDigest::sha384(),
                _ => openssl::hash::MessageDigest::sha512(),
            };
            let mut verifier = openssl::sign::Verifier::new(msg_digest, key)
                .map_err(|err| crate::problem!(BadPublicKey, 400, "Invalid JWS", err.to_string()))?;
            if alg.starts_with("PS") {
                let key_err = |err: openssl::error::ErrorStack| crate::problem!(
                    BadPublicKey, 400, "Invalid JWS", err.to_string()
                );
                verifier.set_rsa_padding(openssl::rsa::Padding::PKCS1_PSS).map_err(key_err)?;
                verifier.set_rsa_pss_saltlen(openssl::sign::RsaPssSaltlen::DIGEST_LENGTH).map_err(key_err)?;
                verifier.set_rsa_mgf1_md(msg_digest).map_err(key_err)?;
            }
            verifier.verify_oneshot(signature_bytes, to_verify.as_bytes()).unwrap_or(false)
        }
        "ES256" | "ES384" | "ES512" => {
            let (msg_digest, curve, field_len) = match alg {
                "ES256" => (openssl::hash::MessageDigest::sha256(), openssl::nid::Nid::X9_62_PRIME256V1, 32),
                "ES384" => (openssl::hash::MessageDigest::sha384(), openssl::nid::Nid::SECP384R1, 48),
                _ => (openssl::hash::MessageDigest::sha512(), openssl::nid::Nid::SECP521R1, 66),
            };
            let ec_key = key.ec_key().map_err(|_| bad_algorithm(alg))?;
            if ec_key.group().curve_name() != Some(curve) {
                return Err(bad_algorithm(alg));
            }
            if signature_bytes.len() != 2 * field_len {
                return Err(invalid_signature());
            }
            let der_sig = openssl::bn::BigNum::from_slice(&signature_bytes[..field_len])
                .and_then(|r| Ok((r, openssl::bn::BigNum::from_slice(&signature_bytes[field_len..])?)))
                .and_then(|(r, s)| openssl::ecdsa::EcdsaSig::from_private_components(r, s))
                .and_then(|sig| sig.to_der())
                .map_err(|_| invalid_signature())?;
            let mut verifier = openssl::sign::Verifier::new(msg_digest, key)
                .map_err(|err| crate::problem!(BadPublicKey, 400, "Invalid JWS", err.to_string()))?;
            verifier.verify_oneshot(&der_sig, to_verify.as_bytes()).unwrap_or(false)
        }
        "EdDSA" => {
            if key.id() != openssl::pkey::Id::ED25519 && key.id() != openssl::pkey::Id::ED448 {
                return Err(bad_algorithm(alg));
            }
            let mut verifier = openssl::sign::Verifier::new_without_digest(key)
                .map_err(|err| crate::problem!(BadPublicKey, 400, "Invalid JWS", err.to_string()))?;
            verifier.verify_oneshot(signature_bytes, to_verify.as_bytes()).unwrap_or(false)
        }
        a => {
            return Err(crate::problem!(
                BadSignatureAlgorithm, 400, "Invalid JWS", format!("'{}' is not a supported algorithm", a)
            ));
        }
    };

    if !verified {
        return Err(invalid_signature());
    }
    Ok(())
}

pub fn decode_jws_payload<R: serde::de::DeserializeOwned>(payload_bytes: &[u8]) -> ACMEResult<R> {
    serde_json::from_slice(payload_bytes).map_err(|err| crate::problem!(
        Malformed, 400, "Invalid JWS", format!("Error decoding payload: '{}'", err)
    ))
}
