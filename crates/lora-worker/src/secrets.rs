//! Service credential resolution.
//!
//! A credential can come from three places, tried in order:
//!
//! 1. **Direct value** in the config file, for local runs
//! 2. **File** such as a mounted container secret
//! 3. **Environment variable**, the usual case on hosted GPU workers

use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Secret from {origin} is empty")]
    Empty { origin: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where to look for one secret. Empty strings count as absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretSource<'a> {
    pub direct: Option<&'a str>,
    pub file: Option<&'a str>,
    pub env_var: Option<&'a str>,
}

impl<'a> SecretSource<'a> {
    pub fn is_configured(&self) -> bool {
        [self.direct, self.file, self.env_var]
            .iter()
            .any(|s| s.is_some_and(|s| !s.is_empty()))
    }

    /// Resolves against an explicit environment lookup.
    pub fn resolve_with<F>(&self, env: F) -> Result<SecretString>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(self.direct) {
            return Ok(SecretString::from(value.to_string()));
        }

        if let Some(path) = non_empty(self.file) {
            let expanded = expand_home(path, &env);
            let content =
                std::fs::read_to_string(&expanded).map_err(|e| SecretError::FileReadError {
                    path: expanded.clone(),
                    source: e,
                })?;
            return checked(content, format!("file '{}'", expanded));
        }

        if let Some(name) = non_empty(self.env_var) {
            return match env(name) {
                Some(value) => checked(value, format!("env var '{}'", name)),
                None => Err(SecretError::EnvVarNotSet {
                    name: name.to_string(),
                }),
            };
        }

        Err(SecretError::NoSourceProvided)
    }

    pub fn resolve(&self) -> Result<SecretString> {
        self.resolve_with(|name| std::env::var(name).ok())
    }
}

/// Resolves a secret from a direct value, a file, or an environment variable.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    SecretSource {
        direct,
        file: file_path,
        env_var,
    }
    .resolve()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

// Files and env vars often carry a trailing newline.
fn checked(raw: String, origin: String) -> Result<SecretString> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SecretError::Empty { origin });
    }
    Ok(SecretString::from(trimmed.to_string()))
}

/// Expands a leading `~` using `HOME`. `~user/...` is not supported.
fn expand_home<F>(path: &str, env: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = env("HOME") {
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
