//! Well-known request options and the request fingerprint.
//!
//! Modeled as a plain struct rather than a typed-key extension map, since
//! the set of fields a plugin attaches to a request is fixed and known
//! ahead of time rather than an open-ended context bag.

use crate::canonical::canonicalize;

/// Options a plugin attaches to every outgoing request before handing it to
/// the integrated pipeline.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// The logical service name, e.g. `"spotify"`.
    pub service: String,
    /// Endpoint tag, e.g. `"/search"`.
    pub endpoint: String,
    /// Traffic profile tag, e.g. `"search"`, `"detail"`, `"download"`.
    pub profile: String,
    /// Raw query parameters prior to canonicalization.
    pub parameters: Vec<(String, String)>,
    /// Optional auth scope, e.g. `"user:abc"`.
    pub auth_scope: Option<String>,
}

impl RequestOptions {
    /// Creates request options for `service`/`endpoint`/`profile` with no
    /// parameters and no auth scope.
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            profile: profile.into(),
            parameters: Vec::new(),
            auth_scope: None,
        }
    }

    /// Appends a query parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    /// Sets the auth scope.
    pub fn with_auth_scope(mut self, scope: impl Into<String>) -> Self {
        self.auth_scope = Some(scope.into());
        self
    }

    /// The canonical parameter string, used both for cache keying and for
    /// redacted request logging.
    pub fn canonical_parameters(&self) -> String {
        canonicalize(
            self.parameters
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }

    /// The request fingerprint, including auth scope only when `vary_by_scope`
    /// is true.
    pub fn fingerprint(&self, vary_by_scope: bool) -> RequestFingerprint {
        RequestFingerprint {
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
            canonical_parameters: self.canonical_parameters(),
            auth_scope: if vary_by_scope {
                self.auth_scope.clone()
            } else {
                None
            },
        }
    }
}

/// A deterministic identity for a logical request: `(service, endpoint,
/// canonical_parameters, auth_scope?)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
    service: String,
    endpoint: String,
    canonical_parameters: String,
    auth_scope: Option<String>,
}

impl RequestFingerprint {
    /// Renders the fingerprint as the cache key string used by
    /// [`crate::cache::ResponseCache`]: `service|endpoint|canonical_parameters[|auth_scope]`.
    pub fn cache_key(&self) -> String {
        let mut key = format!("{}|{}|{}", self.service, self.endpoint, self.canonical_parameters);
        if let Some(scope) = &self.auth_scope {
            key.push('|');
            key.push_str(scope);
        }
        key
    }

    /// The service this fingerprint belongs to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The endpoint tag.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_regardless_of_parameter_order() {
        let a = RequestOptions::new("spotify", "/search", "search")
            .with_parameter("q", "beatles")
            .with_parameter("a", "1");
        let b = RequestOptions::new("spotify", "/search", "search")
            .with_parameter("a", "1")
            .with_parameter("q", "beatles");
        assert_eq!(a.fingerprint(false), b.fingerprint(false));
    }

    #[test]
    fn auth_scope_only_included_when_vary_by_scope_is_true() {
        let opts =
            RequestOptions::new("spotify", "/me", "detail").with_auth_scope("user:abc");
        assert!(!opts.fingerprint(false).cache_key().contains("user:abc"));
        assert!(opts.fingerprint(true).cache_key().contains("user:abc"));
    }

    #[test]
    fn cache_key_is_pipe_delimited() {
        let opts = RequestOptions::new("spotify", "/search", "search").with_parameter("q", "x");
        assert_eq!(
            opts.fingerprint(false).cache_key(),
            "spotify|/search|q=x"
        );
    }
}
