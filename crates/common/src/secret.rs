//! Redacting wrapper for bearer tokens and proxy passes

use std::fmt;
use std::path::Path;

use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Sensitive value. Never printed by Debug/Display, wiped on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the inner value. Keep the borrow short and never log it.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Resolve a string secret from an environment variable, falling back to a file.
    ///
    /// The variable wins when set. A file containing only whitespace yields
    /// `None`, as does a missing variable with no file configured. A configured
    /// file that cannot be read is an error.
    pub fn from_env_or_file(var: &str, file: Option<&Path>) -> Result<Option<Self>> {
        if let Ok(value) = std::env::var(var) {
            let value = value.trim().to_owned();
            if !value.is_empty() {
                return Ok(Some(Self::new(value)));
            }
        }

        let Some(path) = file else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|source| Error::SecretFile {
            path: path.to_path_buf(),
            source,
        })?;
        let value = raw.trim();
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::new(value.to_owned())))
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize + PartialEq> PartialEq for Secret<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: Zeroize + Eq> Eq for Secret<T> {}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = Secret::new(String::from("pass-token-abc"));
        assert_eq!(format!("{secret:?}"), "Secret([REDACTED])");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner_value() {
        let secret = Secret::from(String::from("pass-token-abc"));
        assert_eq!(secret.expose(), "pass-token-abc");
    }

    #[test]
    fn equality_compares_inner_values() {
        let a = Secret::new(String::from("x"));
        assert_eq!(a, a.clone());
        assert_ne!(a, Secret::new(String::from("y")));
    }

    #[test]
    fn env_var_wins_over_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "from-file").unwrap();

        unsafe { std::env::set_var("COMMON_TEST_SECRET_A", "from-env") };
        let secret = Secret::from_env_or_file("COMMON_TEST_SECRET_A", Some(&path))
            .unwrap()
            .unwrap();
        unsafe { std::env::remove_var("COMMON_TEST_SECRET_A") };

        assert_eq!(secret.expose(), "from-env");
    }

    #[test]
    fn file_is_trimmed() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "  from-file\n").unwrap();

        let secret = Secret::from_env_or_file("COMMON_TEST_SECRET_B", Some(&path))
            .unwrap()
            .unwrap();
        assert_eq!(secret.expose(), "from-file");
    }

    #[test]
    fn whitespace_file_yields_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, " \n ").unwrap();

        let secret = Secret::from_env_or_file("COMMON_TEST_SECRET_C", Some(&path)).unwrap();
        assert!(secret.is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let result = Secret::from_env_or_file(
            "COMMON_TEST_SECRET_D",
            Some(Path::new("/nonexistent/guardian-token")),
        );
        assert!(matches!(result, Err(Error::SecretFile { .. })));
    }

    #[test]
    fn nothing_configured_yields_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let secret = Secret::from_env_or_file("COMMON_TEST_SECRET_E", None).unwrap();
        assert!(secret.is_none());
    }
}
