//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. `SecretString` implements `Debug`
//! with redaction, so any struct that derives `Debug` while holding one
//! cannot leak the value via `{:?}` or tracing fields. Secrets are zeroized
//! on drop.
//!
//! Use `SecretString` for connection strings (the persistence DSN in the
//! gateway config) and any credential material handed to external
//! collaborators. Access requires an explicit `expose_secret()` call.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("postgres://user:pw@db/messenger");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("pw"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("hunter2");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct StoreConfig {
            host: String,
            dsn: SecretString,
        }

        let cfg = StoreConfig {
            host: "db-1".to_string(),
            dsn: SecretString::from("super-secret"),
        };

        let debug_str = format!("{cfg:?}");
        assert!(debug_str.contains("db-1"));
        assert!(!debug_str.contains("super-secret"));
    }
}
