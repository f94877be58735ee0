//! SASL authentication mechanisms

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cormorant_common::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Identity and secret extracted from a finished exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Result of feeding one client response to an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send this challenge and wait for another response
    Challenge(Vec<u8>),
    /// The exchange is complete
    Done(Credentials),
}

/// One in-progress negotiation
pub trait SaslExchange: Send {
    /// Consume a decoded client response. Malformed input fails with
    /// [`Error::Auth`].
    fn step(&mut self, response: &[u8]) -> Result<SaslStep>;
}

/// A named SASL mechanism
pub trait SaslMechanism: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the mechanism exposes the password in the clear
    fn is_plaintext(&self) -> bool;

    fn start(&self) -> Box<dyn SaslExchange>;
}

/// Mechanisms offered by the server, keyed by name
#[derive(Clone, Default)]
pub struct SaslRegistry {
    mechanisms: Vec<Arc<dyn SaslMechanism>>,
}

impl SaslRegistry {
    /// Registry without any mechanism
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry offering `PLAIN`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainMechanism));
        registry
    }

    /// Add a mechanism, replacing one with the same name
    pub fn register(&mut self, mechanism: Arc<dyn SaslMechanism>) {
        self.mechanisms.retain(|m| m.name() != mechanism.name());
        self.mechanisms.push(mechanism);
    }

    /// Look up a mechanism by name, ignoring case
    pub fn get(&self, name: &str) -> Option<Arc<dyn SaslMechanism>> {
        self.mechanisms
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Names of the mechanisms that may be offered, leaving out plaintext
    /// ones unless `plaintext_allowed`
    pub fn available(&self, plaintext_allowed: bool) -> impl Iterator<Item = &'static str> + '_ {
        self.mechanisms
            .iter()
            .filter(move |m| plaintext_allowed || !m.is_plaintext())
            .map(|m| m.name())
    }
}

/// Decode a base64 client response. A lone `=` is an empty response.
pub fn decode_response(line: &str) -> Result<Vec<u8>> {
    let line = line.trim();
    if line == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(line)
        .map_err(|e| Error::Auth(format!("Invalid base64: {}", e)))
}

/// Encode a server challenge for a continuation line
pub fn encode_challenge(challenge: &[u8]) -> String {
    BASE64.encode(challenge)
}

/// RFC 4616 PLAIN
pub struct PlainMechanism;

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn is_plaintext(&self) -> bool {
        true
    }

    fn start(&self) -> Box<dyn SaslExchange> {
        Box::new(PlainExchange)
    }
}

struct PlainExchange;

impl SaslExchange for PlainExchange {
    fn step(&mut self, response: &[u8]) -> Result<SaslStep> {
        // [authzid] NUL authcid NUL passwd
        let parts: Vec<&[u8]> = response.split(|&b| b == 0).collect();
        if parts.len() != 3 {
            return Err(Error::Auth(format!(
                "Expected 3 fields, got {}",
                parts.len()
            )));
        }

        let field = |bytes: &[u8]| {
            String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Auth("Credentials are not UTF-8".to_string()))
        };
        let authzid = field(parts[0])?;
        let username = field(parts[1])?;
        let password = field(parts[2])?;

        if username.is_empty() {
            return Err(Error::Auth("Empty authentication identity".to_string()));
        }
        if !authzid.is_empty() && authzid != username {
            return Err(Error::Auth("Authorization identity mismatch".to_string()));
        }

        debug!(username = %username, "PLAIN exchange complete");
        Ok(SaslStep::Done(Credentials { username, password }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plain(payload: &str) -> Result<SaslStep> {
        let registry = SaslRegistry::with_defaults();
        let mechanism = registry.get("plain").unwrap();
        let mut exchange = mechanism.start();
        exchange.step(&decode_response(payload)?)
    }

    #[test]
    fn test_plain_success() {
        assert_eq!(
            plain("AHVzZXJuYW1lAHBhc3N3b3Jk").unwrap(),
            SaslStep::Done(Credentials {
                username: "username".to_string(),
                password: "password".to_string(),
            })
        );
    }

    #[test]
    fn test_plain_matching_authzid() {
        let payload = BASE64.encode(b"bob\0bob\0pw");
        assert!(matches!(plain(&payload), Ok(SaslStep::Done(_))));

        let other = BASE64.encode(b"admin\0bob\0pw");
        assert!(matches!(plain(&other), Err(Error::Auth(_))));
    }

    #[test]
    fn test_plain_malformed() {
        // Valid base64, wrong structure
        let result = plain("BHVzZXJuYW1lAHBhc3N3b6Jk");
        assert!(matches!(result, Err(Error::Auth(_))));

        let two_fields = BASE64.encode(b"user\0pass");
        assert!(matches!(plain(&two_fields), Err(Error::Auth(_))));

        assert!(matches!(plain("not base64!"), Err(Error::Auth(_))));
        assert!(matches!(plain("="), Err(Error::Auth(_))));
    }

    #[test]
    fn test_registry() {
        let registry = SaslRegistry::with_defaults();
        assert!(registry.get("plain").is_some());
        assert!(registry.get("CRAM-MD5").is_none());
        assert!(SaslRegistry::new().get("PLAIN").is_none());
        assert_eq!(registry.available(true).collect::<Vec<_>>(), vec!["PLAIN"]);
        assert_eq!(registry.available(false).count(), 0);
    }

    #[test]
    fn test_encode_challenge() {
        assert_eq!(encode_challenge(b""), "");
        assert_eq!(encode_challenge(b"Username:"), "VXNlcm5hbWU6");
    }
}
