use axum::http::HeaderMap;
use std::fmt;

/// Identity of a connecting peer, read from request headers at handshake time.
///
/// Missing headers produce empty fields. Two identities are equal iff both
/// fields match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ConnectionIdentity {
    pub id: String,
    pub group: String,
}

impl ConnectionIdentity {
    pub fn new(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
        }
    }

    /// Extract the identity from the configured id and group headers.
    pub fn from_headers(headers: &HeaderMap, id_header: &str, group_header: &str) -> Self {
        Self {
            id: header_value(headers, id_header),
            group: header_value(headers, group_header),
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.group, self.id)
    }
}
