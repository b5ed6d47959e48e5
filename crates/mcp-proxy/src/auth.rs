//! Shared-token auth gate, composed directly over `subtle` for a
//! constant-time comparison rather than `==` on a security-sensitive token.

use subtle::ConstantTimeEq;

#[derive(Clone, Debug, Default)]
pub struct AuthGate {
    token: Option<String>,
}

impl AuthGate {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    /// Whether auth is configured at all.
    pub fn configured(&self) -> bool {
        self.token.is_some()
    }

    /// Validate a caller-supplied token. Always returns `true` when auth is
    /// not configured. Comparison is constant-time to avoid leaking token
    /// length/prefix via timing.
    pub fn validate(&self, provided: Option<&str>) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        let Some(provided) = provided else {
            return false;
        };
        if provided.len() != expected.len() {
            return false;
        }
        expected.as_bytes().ct_eq(provided.as_bytes()).into()
    }

    /// The key to use for rate-limiting: the provided token, or
    /// `"anonymous"` when none was supplied.
    pub fn rate_limit_key<'a>(provided: Option<&'a str>) -> &'a str {
        provided.unwrap_or("anonymous")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_gate_allows_everything() {
        let gate = AuthGate::new(None);
        assert!(!gate.configured());
        assert!(gate.validate(None));
        assert!(gate.validate(Some("whatever")));
    }

    #[test]
    fn configured_gate_requires_matching_token() {
        let gate = AuthGate::new(Some("secret".to_string()));
        assert!(gate.configured());
        assert!(gate.validate(Some("secret")));
        assert!(!gate.validate(Some("wrong")));
        assert!(!gate.validate(None));
    }

    #[test]
    fn rate_limit_key_defaults_to_anonymous() {
        assert_eq!(AuthGate::rate_limit_key(None), "anonymous");
        assert_eq!(AuthGate::rate_limit_key(Some("tok")), "tok");
    }
}
