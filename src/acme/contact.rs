/// Contact address verification policy, chosen in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactVerifier {
    /// Accepts `mailto:` URLs with a single address and no header fields.
    Default,
    AcceptAll,
}

impl std::default::Default for ContactVerifier {
    fn default() -> Self {
        ContactVerifier::Default
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Unsupported(String),
    Invalid(String),
}

impl ContactVerifier {
    pub fn verify(&self, contact: &str) -> Verdict {
        match self {
            ContactVerifier::AcceptAll => Verdict::Ok,
            ContactVerifier::Default => parse_contact(contact),
        }
    }

    /// Checks every contact; the first failure decides the problem returned.
    pub fn verify_all(&self, contacts: &[String]) -> super::ACMEResult<()> {
        for contact in contacts {
            match self.verify(contact) {
                Verdict::Ok => {}
                Verdict::Unsupported(detail) => {
                    return Err(crate::problem!(UnsupportedContact, 400, "Unsupported contact", detail));
                }
                Verdict::Invalid(detail) => {
                    return Err(crate::problem!(InvalidContact, 400, "Invalid contact", detail));
                }
            }
        }
        Ok(())
    }
}

fn parse_contact(contact: &str) -> Verdict {
    let url = match url::Url::parse(contact) {
        Ok(v) => v,
        Err(_) => return Verdict::Invalid("Invalid URL formatting".to_string()),
    };
    match url.scheme() {
        "mailto" => {
            if url.query().is_some() {
                return Verdict::Invalid("hfields not allowed in mailto URL".to_string());
            }
            let path = url.path();
            if path.contains(',') {
                return Verdict::Invalid("No more than one address per URL allowed".to_string());
            }
            match path.split_once('@') {
                Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Verdict::Ok,
                _ => Verdict::Invalid(format!("'{}' is not an email address", path)),
            }
        }
        s => Verdict::Unsupported(format!("Unsupported URL scheme '{}'", s)),
    }
}
