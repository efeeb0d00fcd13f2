#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHeader {
    pub url: String,
    pub relation: String,
}

impl LinkHeader {
    pub fn index(base_url: &str) -> Self {
        LinkHeader {
            url: format!("{}directory", base_url),
            relation: "index".to_string(),
        }
    }

    pub fn up(url: String) -> Self {
        LinkHeader {
            url,
            relation: "up".to_string(),
        }
    }

    pub fn header_value(&self) -> String {
        format!("<{}>;rel=\"{}\"", self.url, self.relation)
    }
}

/// Appends `Link` headers to a response.
pub fn adjoin_links(resp: &mut super::Response, links: Vec<LinkHeader>) {
    for link in links {
        resp.headers.push(("Link".to_string(), link.header_value()));
    }
}
