use crate::types;

pub const JOSE_CONTENT_TYPE: &str = "application/jose+json";
pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub const PEM_CHAIN_CONTENT_TYPE: &str = "application/pem-certificate-chain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Other,
}

/// An HTTP request as seen by the gateway, independent of the web framework.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Absolute request path without query, e.g. `/acme/newOrder`.
    pub path: String,
    pub host: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn empty(status: u16) -> Self {
        Response {
            status,
            headers: vec![],
            content_type: None,
            body: vec![],
        }
    }

    pub fn json<T: serde::Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Response {
                status,
                headers: vec![],
                content_type: Some(JSON_CONTENT_TYPE.to_string()),
                body,
            },
            Err(err) => {
                error!("Unable to serialize response: {}", err);
                Self::problem(crate::internal_server_error!())
            }
        }
    }

    pub fn problem(err: types::error::Error) -> Self {
        Response {
            status: err.status,
            headers: vec![],
            content_type: Some(PROBLEM_CONTENT_TYPE.to_string()),
            body: serde_json::to_vec(&err).unwrap_or_default(),
        }
    }

    pub fn pem_chain(pem: Vec<u8>) -> Self {
        Response {
            status: 200,
            headers: vec![],
            content_type: Some(PEM_CHAIN_CONTENT_TYPE.to_string()),
            body: pem,
        }
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_location(self, url: String) -> Self {
        self.with_header("Location", url)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers.iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Whether a Content-Type header names `application/jose+json`, ignoring parameters.
pub fn is_jose_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => ct.split(';').next()
            .map_or(false, |mime| mime.trim().eq_ignore_ascii_case(JOSE_CONTENT_TYPE)),
        None => false,
    }
}
