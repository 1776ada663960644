/// An announce URL vetted for use by the announcer.
///
/// Only HTTP(S) trackers are supported; anything else is rejected here so
/// the announce rotation can skip it without ever attempting a request.
/// The stored form is exactly what building a request needs: the URL
/// itself plus the separator for splicing pre-encoded query parameters on.
#[derive(Debug, PartialEq, Clone)]
pub struct AnnounceUrl {
    url: String,
    query_separator: char,
}

/// Posible `AnnounceUrl` errors.
#[derive(Debug, PartialEq)]
pub enum AnnounceUrlError {
    UnsupportedScheme(String),
    MissingHost,
    InvalidPort(String),
}

impl AnnounceUrl {
    /// Vets a tracker URL.
    ///
    /// It returns an `AnnounceUrlError` if:
    /// - the scheme is missing or is neither http nor https.
    /// - there is no host.
    /// - the port is not a number.
    pub fn parse(url: &str) -> Result<AnnounceUrl, AnnounceUrlError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| AnnounceUrlError::UnsupportedScheme(String::from("none")))?;
        if scheme != "http" && scheme != "https" {
            return Err(AnnounceUrlError::UnsupportedScheme(scheme.to_string()));
        }

        let authority = rest.split(|c| c == '/' || c == '?').next().unwrap_or("");
        if authority.is_empty() || authority.starts_with(':') {
            return Err(AnnounceUrlError::MissingHost);
        }
        if let Some((_, port)) = authority.rsplit_once(':') {
            // a trailing ']' means the colon belonged to an IPv6 literal
            if !port.ends_with(']') && port.parse::<u16>().is_err() {
                return Err(AnnounceUrlError::InvalidPort(port.to_string()));
            }
        }

        Ok(AnnounceUrl {
            query_separator: if url.contains('?') { '&' } else { '?' },
            url: url.to_string(),
        })
    }

    /// Splices a pre-encoded query string onto the URL, respecting any
    /// query the tracker URL already carries.
    pub fn with_query(&self, query: &str) -> String {
        format!("{}{}{}", self.url, self.query_separator, query)
    }
}
