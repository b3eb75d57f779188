use crate::retry::BackendError;
use secrecy::SecretString;
use std::env;

/// Access key pair sourced from environment variables.
#[derive(Clone, Debug)]
pub struct Credentials {
    key: String,
    secret: SecretString,
}

impl Credentials {
    /// Read the pair named by `key_var`/`secret_var`.
    ///
    /// # Errors
    /// `Authz` when either variable is unset, so a misconfigured destination
    /// fails before any transfer starts.
    pub fn from_env(key_var: &str, secret_var: &str) -> Result<Self, BackendError> {
        let key = env::var(key_var)
            .map_err(|_| BackendError::Authz(format!("{key_var} is not set")))?;
        let secret = env::var(secret_var)
            .map_err(|_| BackendError::Authz(format!("{secret_var} is not set")))?;

        Ok(Self {
            key,
            secret: SecretString::new(secret.into()),
        })
    }

    #[must_use]
    pub fn access_key_id(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn secret_access_key(&self) -> SecretString {
        self.secret.clone()
    }
}
