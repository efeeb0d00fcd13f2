use std::collections::BTreeMap;
use std::convert::TryFrom;
use base64::prelude::*;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlattenedJWS {
    pub payload: String,
    pub protected: String,
    pub signature: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JWSProtectedHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crit: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<JWK>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct JWK {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(flatten)]
    pub params: JWKType
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum JWKType {
    EC {
        crv: String,
        x: String,
        y: String,
    },
    RSA {
        n: String,
        e: String,
    },
    OKP {
        crv: String,
        x: String,
    }
}

impl JWK {
    /// The required members of the key (RFC 7638 §3.2), sorted by name.
    pub fn canonical(&self) -> Result<BTreeMap<String, String>, String> {
        let mut map = BTreeMap::new();
        match (self.kty.as_str(), &self.params) {
            ("EC", JWKType::EC { crv, x, y }) => {
                map.insert("crv".to_string(), crv.clone());
                map.insert("x".to_string(), x.clone());
                map.insert("y".to_string(), y.clone());
            }
            ("RSA", JWKType::RSA { n, e }) => {
                map.insert("e".to_string(), e.clone());
                map.insert("n".to_string(), n.clone());
            }
            ("OKP", JWKType::OKP { crv, x }) => {
                map.insert("crv".to_string(), crv.clone());
                map.insert("x".to_string(), x.clone());
            }
            (o, _) => return Err(format!("Invalid key parameters for key type '{}'", o))
        }
        map.insert("kty".to_string(), self.kty.clone());
        Ok(map)
    }

    pub fn from_canonical(map: &BTreeMap<String, String>) -> Result<Self, String> {
        let get = |k: &str| map.get(k).cloned().ok_or_else(|| format!("Missing '{}' parameter", k));
        let kty = get("kty")?;
        let params = match kty.as_str() {
            "EC" => JWKType::EC { crv: get("crv")?, x: get("x")?, y: get("y")? },
            "RSA" => JWKType::RSA { n: get("n")?, e: get("e")? },
            "OKP" => JWKType::OKP { crv: get("crv")?, x: get("x")? },
            o => return Err(format!("'{}' is not a supported key type", o))
        };
        Ok(JWK {
            kty,
            alg: None,
            kid: None,
            params,
        })
    }
}

/// RFC 7638 thumbprint of a canonical key map.
pub fn thumbprint(canonical: &BTreeMap<String, String>) -> String {
    let json = serde_json::to_string(canonical).unwrap_or_default();
    let digest = openssl::sha::sha256(json.as_bytes());
    BASE64_URL_SAFE_NO_PAD.encode(digest)
}

impl TryFrom<&openssl::pkey::PKey<openssl::pkey::Public>> for JWK {
    type Error = String;

    fn try_from(from: &openssl::pkey::PKey<openssl::pkey::Public>) -> Result<Self, Self::Error> {
        let (kty, params) = match from.id() {
            openssl::pkey::Id::EC => {
                let ec_key = from.ec_key().map_err(|e| e.to_string())?;

                let crv = match ec_key.group().curve_name() {
                    Some(openssl::nid::Nid::X9_62_PRIME256V1) => "P-256",
                    Some(openssl::nid::Nid::SECP384R1) => "P-384",
                    Some(openssl::nid::Nid::SECP521R1) => "P-521",
                    _ => return Err("Unknown curve".to_string()),
                }.to_string();
                let field_len = ((ec_key.group().degree() + 7) / 8) as i32;

                let pubkey = ec_key.public_key();
                let mut ctx = openssl::bn::BigNumContext::new().map_err(|e| e.to_string())?;
                let mut x = openssl::bn::BigNum::new().map_err(|e| e.to_string())?;
                let mut y = openssl::bn::BigNum::new().map_err(|e| e.to_string())?;
                pubkey.affine_coordinates_gfp(ec_key.group(), &mut x, &mut y, &mut ctx)
                    .map_err(|e| e.to_string())?;

                ("EC", JWKType::EC {
                    crv,
                    x: BASE64_URL_SAFE_NO_PAD.encode(x.to_vec_padded(field_len).map_err(|e| e.to_string())?),
                    y: BASE64_URL_SAFE_NO_PAD.encode(y.to_vec_padded(field_len).map_err(|e| e.to_string())?),
                })
            },
            openssl::pkey::Id::RSA => {
                let rsa_key = from.rsa().map_err(|e| e.to_string())?;

                ("RSA", JWKType::RSA {
                    n: BASE64_URL_SAFE_NO_PAD.encode(rsa_key.n().to_vec()),
                    e: BASE64_URL_SAFE_NO_PAD.encode(rsa_key.e().to_vec()),
                })
            },
            openssl::pkey::Id::ED25519 | openssl::pkey::Id::ED448 => {
                let crv = if from.id() == openssl::pkey::Id::ED25519 { "Ed25519" } else { "Ed448" };
                let raw = from.raw_public_key().map_err(|e| e.to_string())?;
                ("OKP", JWKType::OKP {
                    crv: crv.to_string(),
                    x: BASE64_URL_SAFE_NO_PAD.encode(raw),
                })
            }
            _ => return Err("Unsupported key type".to_string())
        };

        Ok(JWK {
            kty: kty.to_string(),
            params,
            kid: None,
            alg: None
        })
    }
}

fn decode_param(name: &str, value: &str) -> Result<Vec<u8>, String> {
    BASE64_URL_SAFE_NO_PAD.decode(value).map_err(|err| format!("Invalid {} parameter: {}", name, err))
}

fn decode_bn(name: &str, value: &str) -> Result<openssl::bn::BigNum, String> {
    openssl::bn::BigNum::from_slice(&decode_param(name, value)?)
        .map_err(|err| format!("Invalid {} parameter: {}", name, err))
}

impl TryFrom<&JWK> for openssl::pkey::PKey<openssl::pkey::Public> {
    type Error = String;

    fn try_from(from: &JWK) -> Result<Self, Self::Error> {
        match (from.kty.as_str(), &from.params) {
            ("EC", JWKType::EC { crv, x, y }) => {
                let nid = match crv.as_str() {
                    "P-256" => openssl::nid::Nid::X9_62_PRIME256V1,
                    "P-384" => openssl::nid::Nid::SECP384R1,
                    "P-521" => openssl::nid::Nid::SECP521R1,
                    o => return Err(format!("'{}' is not a supported curve", o))
                };
                let ec_group = openssl::ec::EcGroup::from_curve_name(nid).map_err(|e| e.to_string())?;
                let x = decode_bn("x", x)?;
                let y = decode_bn("y", y)?;
                let key = openssl::ec::EcKey::from_public_key_affine_coordinates(&ec_group, &x, &y)
                    .map_err(|err| format!("Invalid public key: {}", err))?;
                key.check_key().map_err(|err| format!("Invalid public key: {}", err))?;
                openssl::pkey::PKey::from_ec_key(key).map_err(|e| e.to_string())
            },
            ("RSA", JWKType::RSA { n, e }) => {
                let n = decode_bn("n", n)?;
                let e = decode_bn("e", e)?;
                let key = openssl::rsa::Rsa::from_public_components(n, e)
                    .map_err(|err| format!("Invalid public key: {}", err))?;
                openssl::pkey::PKey::from_rsa(key).map_err(|e| e.to_string())
            },
            ("OKP", JWKType::OKP { crv, x }) => {
                let id = match crv.as_str() {
                    "Ed25519" => openssl::pkey::Id::ED25519,
                    "Ed448" => openssl::pkey::Id::ED448,
                    o => return Err(format!("'{}' is not a supported curve", o))
                };
                let x = decode_param("x", x)?;
                openssl::pkey::PKey::public_key_from_raw_bytes(&x, id)
                    .map_err(|err| format!("Invalid public key: {}", err))
            }
            ("EC", _) | ("RSA", _) | ("OKP", _) => Err("Invalid key parameters".to_string()),
            (o, _) => Err(format!("'{}' is not a supported key type", o))
        }
    }
}
