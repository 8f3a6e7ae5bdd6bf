use zeroize::Zeroize;

use super::AuthError;
use crate::prompt::Prompter;
use crate::secrets::{SecretName, SecretStore};

/// Username and password for local-style providers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        if let Some(password) = self.password.as_mut() {
            password.zeroize();
        }
    }
}

impl Credentials {
    /// A record is worth saving when at least one half is present.
    pub fn is_storable(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            || self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn is_complete(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Environment first, then the store. Stored values are only consulted when they
    /// were remembered on a previous sign-in.
    pub async fn load(secrets: &SecretStore) -> Result<Self, AuthError> {
        Ok(Self {
            username: secrets.get(SecretName::Username).await?.filter(|v| !v.is_empty()),
            password: secrets.get(SecretName::Password).await?.filter(|v| !v.is_empty()),
        })
    }

    /// Asks for whatever is missing.
    pub fn complete(mut self, prompter: &dyn Prompter, interactive: bool) -> Result<Self, AuthError> {
        if self.is_complete() {
            return Ok(self);
        }
        if !interactive {
            return Err(AuthError::MissingCredentials);
        }
        if self.username.as_deref().is_none_or(str::is_empty) {
            let username = prompter.input("Username:")?;
            if username.trim().is_empty() {
                return Err(AuthError::InvalidCredentials("username is required".into()));
            }
            self.username = Some(username.trim().to_string());
        }
        if self.password.as_deref().is_none_or(str::is_empty) {
            let password = prompter.password("Password:")?;
            if password.is_empty() {
                return Err(AuthError::InvalidCredentials("password is required".into()));
            }
            self.password = Some(password);
        }
        Ok(self)
    }

    pub async fn remember(&self, secrets: &SecretStore) -> Result<(), AuthError> {
        if let Some(username) = self.username.as_deref() {
            secrets.set(SecretName::Username, username).await?;
        }
        if let Some(password) = self.password.as_deref() {
            secrets.set(SecretName::Password, password).await?;
        }
        Ok(())
    }

    pub async fn forget(secrets: &SecretStore) -> Result<(), AuthError> {
        secrets.delete(SecretName::Username).await?;
        secrets.delete(SecretName::Password).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::prompt::{Answer, NoPrompter, ScriptedPrompter};
    use crate::secrets::MemoryVault;

    #[test]
    fn prompts_only_for_missing_half() {
        let prompter = ScriptedPrompter::new([Answer::Text("hunter2".into())]);
        let creds = Credentials {
            username: Some("admin".into()),
            password: None,
        }
        .complete(&prompter, true)
        .expect("complete");
        assert_eq!(creds.password.as_deref(), Some("hunter2"));
        assert_eq!(prompter.asked(), vec!["Password:".to_string()]);
    }

    #[test]
    fn non_interactive_without_credentials_fails() {
        let err = Credentials::default()
            .complete(&NoPrompter, false)
            .expect_err("missing");
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    #[test]
    fn debug_output_hides_password() {
        let creds = Credentials {
            username: Some("admin".into()),
            password: Some("secret".into()),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn remember_and_forget_round_trip() {
        let store = SecretStore::new(Arc::new(MemoryVault::default()), "ctrl.example.com");
        let creds = Credentials {
            username: Some("admin".into()),
            password: Some("pw".into()),
        };
        creds.remember(&store).await.expect("remember");
        assert_eq!(
            store.get_stored(SecretName::Password).await.expect("get"),
            Some("pw".to_string())
        );
        Credentials::forget(&store).await.expect("forget");
        assert_eq!(store.get_stored(SecretName::Username).await.expect("get"), None);
    }
}
