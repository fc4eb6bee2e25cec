//! Credential pool: the ordered list of API keys, one worker each.
//!
//! Keys are loaded once at startup and held for the process lifetime. The
//! pool never queries remaining quota; workers infer exhaustion from the
//! classified error their transcriber returns.

use crate::error::PipelineError;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// One opaque access token.
///
/// `Debug` and `Display` never print the secret, so credentials can sit in
/// structs that are logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The raw token, for adapters that must send it.
    pub fn secret(&self) -> &str {
        &self.token
    }

    /// Short redacted form for log lines: `AIza…9xQ`.
    pub fn redacted(&self) -> String {
        let chars: Vec<char> = self.token.chars().collect();
        if chars.len() <= 8 {
            return "…".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 3..].iter().collect();
        format!("{head}…{tail}")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Ordered credentials; position `i` drives worker `i + 1`.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    /// Build a pool from already-parsed credentials.
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Load the key file. Missing file or zero keys abort the run.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::KeyFileMissing {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(PipelineError::io(path, e)),
        };

        let pool = Self::parse(&text);
        if pool.is_empty() {
            return Err(PipelineError::NoCredentials {
                path: path.to_path_buf(),
            });
        }
        info!("Loaded {} credentials from {}", pool.len(), path.display());
        Ok(pool)
    }

    /// Parse key-file text: first whitespace-delimited token per line.
    ///
    /// Blank lines and lines starting with `#` are skipped, so a key file can
    /// carry labels after the token (`AIza... project-a`) and comments.
    pub fn parse(text: &str) -> Self {
        let credentials = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_whitespace().next())
            .map(Credential::new)
            .collect::<Vec<_>>();
        debug!("Parsed {} credential lines", credentials.len());
        Self { credentials }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }

    pub fn into_vec(self) -> Vec<Credential> {
        self.credentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_takes_first_token_per_line() {
        let pool = CredentialPool::parse("AIzaKEY-one  project-a\n\n  AIzaKEY-two\n# retired\nAIzaKEY-three extra words\n");
        let keys: Vec<&str> = pool.iter().map(|c| c.secret()).collect();
        assert_eq!(keys, vec!["AIzaKEY-one", "AIzaKEY-two", "AIzaKEY-three"]);
    }

    #[test]
    fn parse_empty_text_is_empty_pool() {
        assert!(CredentialPool::parse("\n   \n# nothing\n").is_empty());
    }

    #[test]
    fn load_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = CredentialPool::load(&dir.path().join("keys.txt")).unwrap_err();
        assert!(matches!(err, PipelineError::KeyFileMissing { .. }));
    }

    #[test]
    fn load_file_without_keys_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        std::fs::write(&path, "\n# only comments\n").unwrap();
        let err = CredentialPool::load(&path).unwrap_err();
        assert!(matches!(err, PipelineError::NoCredentials { .. }));
    }

    #[test]
    fn debug_output_is_redacted() {
        let c = Credential::new("AIzaSyD-very-secret-9xQ");
        let shown = format!("{c:?} {c}");
        assert!(!shown.contains("very-secret"), "got: {shown}");
        assert!(shown.contains("AIza…9xQ"));
    }
}
