#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: String,
    pub value: String,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Type {
    DNS,
}

impl Type {
    pub fn from_str(id_type: &str) -> Option<Self> {
        match id_type {
            "dns" => Some(Self::DNS),
            _ => None
        }
    }
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Identifier {
            id_type: "dns".to_string(),
            value: value.to_string(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.value.starts_with("*.")
    }

    /// The identifier as shown in an authorization: wildcard prefix removed.
    pub fn base_domain(&self) -> &str {
        self.value.strip_prefix("*.").unwrap_or(&self.value)
    }
}
