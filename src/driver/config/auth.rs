use std::collections::HashMap;

use crate::value::Value;
use crate::value_map;

/// Authentication data sent to the server as part of HELLO.
///
/// ```
/// use boltdrive::driver::auth::AuthToken;
///
/// let auth = AuthToken::new_basic_auth("neo4j", "super secret");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    data: HashMap<String, Value>,
}

impl AuthToken {
    /// For servers with authentication disabled.
    pub fn new_none_auth() -> Self {
        Self {
            data: value_map!({
                "scheme": "none",
            }),
        }
    }

    /// Username/password authentication.
    pub fn new_basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let password = password.into();
        Self {
            data: value_map!({
                "scheme": "basic",
                "principal": (username),
                "credentials": (password),
            }),
        }
    }

    /// Username/password authentication against a specific realm.
    pub fn new_basic_auth_with_realm(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        let mut token = Self::new_basic_auth(username, password);
        let realm = realm.into();
        token.data.insert("realm".into(), Value::String(realm));
        token
    }

    /// Kerberos authentication with a base64 encoded ticket.
    pub fn new_kerberos_auth(base64_encoded_ticket: impl Into<String>) -> Self {
        let ticket = base64_encoded_ticket.into();
        Self {
            data: value_map!({
                "scheme": "kerberos",
                "principal": "",
                "credentials": (ticket),
            }),
        }
    }

    /// Bearer token (e.g., SSO) authentication.
    pub fn new_bearer_auth(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            data: value_map!({
                "scheme": "bearer",
                "credentials": (token),
            }),
        }
    }

    /// Authentication for custom server-side authentication plugins.
    pub fn new_custom_auth(
        principal: Option<String>,
        credentials: Option<String>,
        realm: Option<String>,
        scheme: Option<String>,
        parameters: Option<HashMap<String, Value>>,
    ) -> Self {
        let mut data = HashMap::with_capacity(5);
        if let Some(principal) = principal {
            data.insert("principal".into(), Value::String(principal));
        }
        if let Some(credentials) = credentials {
            data.insert("credentials".into(), Value::String(credentials));
        }
        if let Some(realm) = realm {
            data.insert("realm".into(), Value::String(realm));
        }
        if let Some(scheme) = scheme {
            data.insert("scheme".into(), Value::String(scheme));
        }
        if let Some(parameters) = parameters {
            data.insert("parameters".into(), Value::Map(parameters));
        }
        Self { data }
    }

    pub(crate) fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }
}

impl Default for AuthToken {
    fn default() -> Self {
        Self::new_none_auth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_shape() {
        let auth = AuthToken::new_basic_auth("alice", "pass");
        assert_eq!(auth.data().get("scheme"), Some(&Value::from("basic")));
        assert_eq!(auth.data().get("principal"), Some(&Value::from("alice")));
        assert_eq!(auth.data().get("credentials"), Some(&Value::from("pass")));
        assert_eq!(auth.data().get("realm"), None);
    }

    #[test]
    fn realm_is_added_on_top_of_basic_auth() {
        let auth = AuthToken::new_basic_auth_with_realm("alice", "pass", "wonderland");
        assert_eq!(auth.data().get("realm"), Some(&Value::from("wonderland")));
    }

    #[test]
    fn default_is_none_auth() {
        assert_eq!(
            AuthToken::default().data().get("scheme"),
            Some(&Value::from("none"))
        );
    }
}
