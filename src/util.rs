use base64::prelude::*;

/// Encodes an entity id as 8 little-endian bytes, base64url without padding (11 characters).
pub fn id_to_b64(id: u64) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(id.to_le_bytes())
}

pub fn b64_to_id(b64: &str) -> Option<u64> {
    if b64.len() != 11 {
        return None;
    }
    let id_bytes = match BASE64_URL_SAFE_NO_PAD.decode(b64) {
        Ok(n) => n,
        Err(_) => {
            return None;
        }
    };
    let id_bytes: [u8; 8] = match id_bytes.try_into() {
        Ok(b) => b,
        Err(_) => return None,
    };
    Some(u64::from_le_bytes(id_bytes))
}

/// Encodes a challenge sub-index as 4 little-endian bytes, base64url without padding (6 characters).
pub fn sub_id_to_b64(sub_id: u32) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(sub_id.to_le_bytes())
}

pub fn b64_to_sub_id(b64: &str) -> Option<u32> {
    if b64.len() != 6 {
        return None;
    }
    let id_bytes: [u8; 4] = BASE64_URL_SAFE_NO_PAD.decode(b64).ok()?.try_into().ok()?;
    Some(u32::from_le_bytes(id_bytes))
}

pub fn random_u64() -> Result<u64, openssl::error::ErrorStack> {
    let mut buf = [0u8; 8];
    openssl::rand::rand_bytes(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn random_token(num_bytes: usize) -> Result<String, openssl::error::ErrorStack> {
    let mut buf = vec![0u8; num_bytes];
    openssl::rand::rand_bytes(&mut buf)?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(buf))
}

pub fn sha256_b64(data: &[u8]) -> Result<String, openssl::error::ErrorStack> {
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), data)?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(digest))
}

pub fn asn1_time_to_chrono(
    time: &openssl::asn1::Asn1TimeRef,
) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::offset::TimeZone;
    let epoch = openssl::asn1::Asn1Time::from_unix(0).ok()?;
    let diff = epoch.diff(time).ok()?;
    let secs = diff.days as i64 * 86400 + diff.secs as i64;
    chrono::Utc.timestamp_opt(secs, 0).single()
}

pub fn cvt_p<T>(r: *mut T) -> Result<*mut T, openssl::error::ErrorStack> {
    if r.is_null() {
        Err(openssl::error::ErrorStack::get())
    } else {
        Ok(r)
    }
}
