//! Authentication gate
//!
//! Decides at upgrade time whether a client is admitted and which identity
//! it gets. The gate only reads its immutable [`AuthConfig`], so one gate can
//! be shared by every connection task on an endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use portico_config::{AuthOptions, UserEntry};
use tracing::debug;

use crate::connection::Identity;

/// Why the gate refused a client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("credential not recognised")]
    UnknownCredential,
}

/// Resolved authentication policy for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// Admit everyone without a credential check
    pub bypass: bool,
    pub known_users: Vec<UserEntry>,
}

impl AuthConfig {
    /// Resolve configured options against the environment.
    ///
    /// This is the only place the bypass toggle is read; call it once at
    /// startup with `|name| std::env::var(name).ok()`.
    pub fn resolve<F>(options: &AuthOptions, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let bypass = options
            .no_security_env
            .as_deref()
            .and_then(|name| lookup(name))
            .map(|value| is_truthy(&value))
            .unwrap_or(false);

        Self {
            bypass,
            known_users: options.users.clone(),
        }
    }

    pub fn with_users(users: Vec<UserEntry>) -> Self {
        Self {
            bypass: false,
            known_users: users,
        }
    }

    pub fn bypassed() -> Self {
        Self {
            bypass: true,
            known_users: Vec::new(),
        }
    }
}

/// Environment toggle semantics: set and not one of the usual "off" spellings.
pub fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// What the hosting layer exposes about an upgrade request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub peer: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build a context from raw request parts.
    pub fn from_parts<'a, I>(path: &str, query: Option<&str>, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut context = Self::new(path);
        if let Some(query) = query {
            context.query = parse_pairs(query, '&', true);
        }
        for (name, value) in headers {
            context = context.with_header(name, value);
        }
        context
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Add a header. A `Cookie` header is also parsed into [`RequestContext::cookies`].
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name == "cookie" {
            self.cookies.extend(parse_pairs(value, ';', false));
        }
        self.headers.insert(name, value.to_string());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// The credential a client presented, if any.
    ///
    /// Checked in order: `Authorization: Bearer`, `token` query parameter,
    /// `token` cookie, `user` query parameter. The auth scheme matches
    /// case-insensitively.
    pub fn claimed_credential(&self) -> Option<&str> {
        let bearer = self.headers.get("authorization").and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });

        [
            bearer,
            self.query.get("token").map(String::as_str),
            self.cookies.get("token").map(String::as_str),
            self.query.get("user").map(String::as_str),
        ]
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty())
    }
}

/// Split `key=value` pairs and percent-decode both sides. Query strings
/// also use `+` for a space; cookies do not.
fn parse_pairs(input: &str, separator: char, plus_as_space: bool) -> HashMap<String, String> {
    input
        .split(separator)
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((
                decode_component(key.trim(), plus_as_space),
                decode_component(value.trim(), plus_as_space),
            ))
        })
        .collect()
}

/// Decoding that yields invalid UTF-8 keeps the raw text.
fn decode_component(raw: &str, plus_as_space: bool) -> String {
    let raw = if plus_as_space {
        raw.replace('+', " ")
    } else {
        raw.to_string()
    };
    urlencoding::decode(&raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.clone())
}

/// Admission decision point for an endpoint
#[derive(Debug, Clone)]
pub struct AuthGate {
    config: Arc<AuthConfig>,
}

impl AuthGate {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Admit or refuse a client.
    ///
    /// With the bypass toggle active every client gets [`Identity::anonymous`]
    /// and the known users are not consulted. Otherwise the claimed credential
    /// must equal a known user's name, or its token when one is configured.
    pub fn authenticate(&self, context: &RequestContext) -> Result<Identity, AuthError> {
        if self.config.bypass {
            debug!(path = %context.path, "authentication bypassed");
            return Ok(Identity::anonymous());
        }

        let claimed = context
            .claimed_credential()
            .ok_or(AuthError::MissingCredential)?;

        self.config
            .known_users
            .iter()
            .find(|user| user.name == claimed || user.token.as_deref() == Some(claimed))
            .map(|user| Identity::user(user.name.clone()))
            .ok_or(AuthError::UnknownCredential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice_gate() -> AuthGate {
        AuthGate::new(AuthConfig::with_users(vec![UserEntry::named("alice")]))
    }

    #[test]
    fn known_user_is_admitted() {
        let context = RequestContext::new("/ws").with_query("user", "alice");
        let identity = alice_gate().authenticate(&context).unwrap();
        assert_eq!(identity, Identity::user("alice"));
        assert!(!identity.anonymous);
    }

    #[test]
    fn unknown_user_is_rejected() {
        let context = RequestContext::new("/ws").with_query("user", "bob");
        assert_eq!(
            alice_gate().authenticate(&context),
            Err(AuthError::UnknownCredential)
        );
    }

    #[test]
    fn missing_credential_is_rejected() {
        let context = RequestContext::new("/ws");
        assert_eq!(
            alice_gate().authenticate(&context),
            Err(AuthError::MissingCredential)
        );
    }

    #[test]
    fn matching_is_case_sensitive() {
        let context = RequestContext::new("/ws").with_query("user", "Alice");
        assert!(alice_gate().authenticate(&context).is_err());
    }

    #[test]
    fn bypass_admits_without_credentials() {
        let gate = AuthGate::new(AuthConfig::bypassed());
        let identity = gate.authenticate(&RequestContext::new("/ws")).unwrap();
        assert_eq!(identity, Identity::anonymous());
    }

    #[test]
    fn bypass_ignores_known_users() {
        let gate = AuthGate::new(AuthConfig {
            bypass: true,
            known_users: vec![UserEntry::named("alice")],
        });
        let context = RequestContext::new("/ws").with_query("user", "alice");
        assert!(gate.authenticate(&context).unwrap().anonymous);
    }

    #[test]
    fn token_maps_to_user_name() {
        let gate = AuthGate::new(AuthConfig::with_users(vec![UserEntry::with_token(
            "bob", "s3cret",
        )]));
        let context = RequestContext::from_parts(
            "/ws",
            None,
            [("Authorization", "Bearer s3cret")],
        );
        assert_eq!(gate.authenticate(&context).unwrap(), Identity::user("bob"));
    }

    #[test]
    fn credential_sources_in_order() {
        let context = RequestContext::from_parts(
            "/ws",
            Some("token=from-query&user=from-user"),
            [("Cookie", "token=from-cookie; theme=dark")],
        );
        assert_eq!(context.claimed_credential(), Some("from-query"));

        let context = RequestContext::from_parts(
            "/ws",
            Some("user=from-user"),
            [("Cookie", "token=from-cookie; theme=dark")],
        );
        assert_eq!(context.claimed_credential(), Some("from-cookie"));
        assert_eq!(context.cookies.get("theme").map(String::as_str), Some("dark"));

        let context = RequestContext::from_parts("/ws", Some("user=from-user&token="), std::iter::empty());
        assert_eq!(context.claimed_credential(), Some("from-user"));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let gate = AuthGate::new(AuthConfig::with_users(vec![UserEntry::with_token(
            "bob", "s3cret",
        )]));
        for header in ["bearer s3cret", "BEARER s3cret", "Bearer   s3cret"] {
            let context = RequestContext::from_parts("/ws", None, [("Authorization", header)]);
            assert_eq!(
                gate.authenticate(&context),
                Ok(Identity::user("bob")),
                "{header:?} should be accepted"
            );
        }

        let basic = RequestContext::from_parts("/ws", None, [("Authorization", "Basic s3cret")]);
        assert_eq!(basic.claimed_credential(), None);
    }

    #[test]
    fn encoded_user_name_is_decoded() {
        let gate = AuthGate::new(AuthConfig::with_users(vec![UserEntry::named("alice smith")]));
        for query in ["user=alice%20smith", "user=alice+smith"] {
            let context = RequestContext::from_parts("/ws", Some(query), std::iter::empty());
            assert_eq!(
                gate.authenticate(&context),
                Ok(Identity::user("alice smith")),
                "{query:?} should be accepted"
            );
        }
    }

    #[test]
    fn encoded_token_is_decoded() {
        let gate = AuthGate::new(AuthConfig::with_users(vec![UserEntry::with_token(
            "bob", "s3cr+t/@",
        )]));

        let from_query = RequestContext::from_parts(
            "/ws",
            Some("token=s3cr%2Bt%2F%40"),
            std::iter::empty(),
        );
        assert_eq!(from_query.claimed_credential(), Some("s3cr+t/@"));
        assert_eq!(gate.authenticate(&from_query), Ok(Identity::user("bob")));

        // A literal '+' in a cookie is not a space
        let from_cookie =
            RequestContext::from_parts("/ws", None, [("Cookie", "token=s3cr+t%2F%40")]);
        assert_eq!(gate.authenticate(&from_cookie), Ok(Identity::user("bob")));
    }

    #[test]
    fn malformed_encoding_is_kept_raw() {
        let context = RequestContext::from_parts("/ws", Some("user=%FF%FE"), std::iter::empty());
        assert_eq!(context.claimed_credential(), Some("%FF%FE"));
    }

    #[test]
    fn resolve_reads_toggle_once() {
        let options = AuthOptions {
            no_security_env: Some("TEST_NO_AUTH".to_string()),
            users: vec![UserEntry::named("alice")],
        };

        let on = AuthConfig::resolve(&options, |name| {
            (name == "TEST_NO_AUTH").then(|| "1".to_string())
        });
        assert!(on.bypass);
        assert_eq!(on.known_users.len(), 1);

        let off = AuthConfig::resolve(&options, |_| Some("false".to_string()));
        assert!(!off.bypass);

        let unset = AuthConfig::resolve(&options, |_| None);
        assert!(!unset.bypass);
    }

    #[test]
    fn resolve_without_toggle_name() {
        let options = AuthOptions::default();
        let config = AuthConfig::resolve(&options, |_| Some("1".to_string()));
        assert!(!config.bypass);
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "yes", "on", "anything"] {
            assert!(is_truthy(value), "{value} should be truthy");
        }
        for value in ["", " ", "0", "false", "FALSE", "no", "off"] {
            assert!(!is_truthy(value), "{value:?} should be falsy");
        }
    }
}
