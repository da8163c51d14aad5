use std::collections::BTreeMap;

use bon::Builder;
use url::Url;

use crate::Result;

/// Phoenix serializer version pinned on every endpoint URL.
const SERIALIZER_VSN: &str = "2.0.0";

/// Immutable connection parameters for the socket singleton.
///
/// Supplied once at construction and never mutated afterwards. The `params`
/// map is sent to the peer as URL query parameters on connect (typically a
/// `jwt` or API token).
///
/// # Examples
///
/// ```
/// use solesocket::ConnectionConfig;
///
/// let config = ConnectionConfig::builder()
///     .url("wss://example.com/socket")
///     .param("jwt", "token")
///     .build();
///
/// assert_eq!(config.url, "wss://example.com/socket");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ConnectionConfig {
    /// Connection parameters appended to the endpoint query string
    #[builder(field)]
    pub params: BTreeMap<String, String>,
    /// Base socket URL, e.g. `wss://example.com/socket`
    #[builder(into)]
    pub url: String,
}

impl<S: connection_config_builder::State> ConnectionConfigBuilder<S> {
    /// Add a single connection parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl ConnectionConfig {
    /// Create a config from a URL and a full parameter map.
    #[must_use]
    pub fn new(url: impl Into<String>, params: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            params,
        }
    }

    /// Build the full WebSocket endpoint URL.
    ///
    /// Appends the `/websocket` path segment the Phoenix server expects, the
    /// serializer version, and the connection params as an URL-encoded query
    /// string.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;

        url.path_segments_mut()
            .map_err(|()| crate::error::Error::validation("socket URL cannot be a base"))?
            .pop_if_empty()
            .push("websocket");

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("vsn", SERIALIZER_VSN);
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_websocket_segment_and_vsn() {
        let config = ConnectionConfig::builder()
            .url("ws://localhost:4000/socket")
            .build();

        let endpoint = config.endpoint().expect("endpoint should parse");
        assert_eq!(
            endpoint.as_str(),
            "ws://localhost:4000/socket/websocket?vsn=2.0.0"
        );
    }

    #[test]
    fn endpoint_encodes_params() {
        let config = ConnectionConfig::builder()
            .url("wss://example.com/socket")
            .param("jwt", "a b+c")
            .param("client", "rust")
            .build();

        let endpoint = config.endpoint().expect("endpoint should parse");
        let query = endpoint.query().expect("query should be present");

        assert!(query.starts_with("vsn=2.0.0"));
        assert!(query.contains("jwt=a+b%2Bc"));
        assert!(query.contains("client=rust"));
    }

    #[test]
    fn endpoint_rejects_unparseable_url() {
        let config = ConnectionConfig::new("mockUrl", BTreeMap::new());
        let err = config.endpoint().expect_err("bare word is not a URL");
        assert_eq!(err.kind(), crate::error::Kind::Validation);
    }
}
