use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};

use crate::ValidationError;

/// Canonical `scheme://host[:port]` form of a submitted address.
///
/// Only [`normalize`] constructs one, so the scheme is always `http` or
/// `https`, the host is lower-case, and a default port never appears.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for CanonicalUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for CanonicalUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Validate a raw address and reduce it to its canonical origin.
///
/// The scheme must be spelled out; bare domains such as `example.com` are
/// rejected. Path, query, fragment and credentials are discarded.
///
/// # Errors
/// Returns [`ValidationError`] for empty input, a missing or non-http(s)
/// scheme, a missing host, or any other unparseable address.
pub fn normalize(raw: &str) -> Result<CanonicalUrl, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }

    let Some((scheme, rest)) = trimmed.split_once("://") else {
        return Err(ValidationError::Malformed(trimmed.to_string()));
    };
    if !is_scheme_token(scheme) {
        return Err(ValidationError::Malformed(trimmed.to_string()));
    }

    let scheme = scheme.to_ascii_lowercase();
    let Some(default_port) = default_port(&scheme) else {
        return Err(ValidationError::UnsupportedScheme(scheme));
    };

    if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
        return Err(ValidationError::MissingHost(trimmed.to_string()));
    }
    if rest.chars().any(char::is_whitespace) {
        return Err(ValidationError::Malformed(trimmed.to_string()));
    }

    let parsed = url::Url::parse(trimmed).map_err(|err| match err {
        url::ParseError::EmptyHost => ValidationError::MissingHost(trimmed.to_string()),
        other => ValidationError::Malformed(format!("{trimmed}: {other}")),
    })?;

    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ValidationError::MissingHost(trimmed.to_string()))?
        .to_ascii_lowercase();

    let canonical = match parsed.port().filter(|port| *port != default_port) {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    };
    Ok(CanonicalUrl(canonical))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

// RFC 3986: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )
fn is_scheme_token(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
}
