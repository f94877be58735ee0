//! In-memory backend

use super::{Shared, MemoryUser};
use crate::repository::{Backend, User};
use crate::updates::UpdateBus;
use async_trait::async_trait;
use cormorant_common::config::{BackendConfig, Provisioning};
use cormorant_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Process-wide registry of users, keyed by username
pub struct MemoryBackend {
    users: RwLock<HashMap<String, Arc<MemoryUser>>>,
    provisioning: Provisioning,
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(provisioning: Provisioning, update_buffer: usize) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            provisioning,
            shared: Arc::new(Shared::new(update_buffer)),
        }
    }

    /// Build a backend with the configured policy and seeded accounts
    pub fn from_config(config: &BackendConfig) -> Self {
        let shared = Arc::new(Shared::new(config.update_buffer));
        let users = config
            .seed_users
            .iter()
            .map(|seed| {
                let user = MemoryUser::new(shared.clone(), &seed.username, &seed.password);
                (seed.username.clone(), user)
            })
            .collect();

        Self {
            users: RwLock::new(users),
            provisioning: config.provisioning,
            shared,
        }
    }

    /// Pre-provision an account
    pub async fn add_user(&self, username: &str, password: &str) -> Result<()> {
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(Error::AlreadyExists(format!("User already exists: {}", username)));
        }
        users.insert(
            username.to_string(),
            MemoryUser::new(self.shared.clone(), username, password),
        );
        info!(username = %username, "User added");
        Ok(())
    }

    pub fn provisioning(&self) -> Provisioning {
        self.provisioning
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn login(&self, username: &str, password: &str) -> Result<Arc<dyn User>> {
        // Exclusive: a first login may insert the user.
        let mut users = self.users.write().await;

        let user = match users.get(username) {
            Some(user) => user.clone(),
            None if self.provisioning == Provisioning::Auto => {
                let user = MemoryUser::new(self.shared.clone(), username, password);
                users.insert(username.to_string(), user.clone());
                info!(username = %username, "User provisioned on first login");
                return Ok(user);
            }
            None => {
                debug!(username = %username, "Unknown user");
                return Err(Error::InvalidCredentials);
            }
        };

        if user.check_password(password) {
            Ok(user)
        } else {
            Err(Error::InvalidCredentials)
        }
    }

    fn updates(&self) -> &UpdateBus {
        &self.shared.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cormorant_common::config::SeedUser;
    use cormorant_common::ErrorKind;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_first_use_wins() {
        let backend = MemoryBackend::new(Provisioning::Auto, 16);

        let user = backend.login("alice", "secret").await.unwrap();
        assert_eq!(user.username(), "alice");

        let err = backend.login("alice", "other").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Credentials);

        assert!(backend.login("alice", "secret").await.is_ok());
    }

    #[tokio::test]
    async fn test_strict_rejects_unknown_users() {
        let backend = MemoryBackend::new(Provisioning::Strict, 16);
        let unknown = backend.login("mallory", "x").await.err().unwrap();
        assert!(matches!(unknown, Error::InvalidCredentials));

        backend.add_user("bob", "hunter2").await.unwrap();
        assert!(backend.login("bob", "hunter2").await.is_ok());

        let wrong = backend.login("bob", "hunter3").await.err().unwrap();
        assert_eq!(wrong.client_message(), unknown.client_message());
    }

    #[tokio::test]
    async fn test_add_user_twice_fails() {
        let backend = MemoryBackend::new(Provisioning::Strict, 16);
        backend.add_user("bob", "a").await.unwrap();
        assert!(matches!(
            backend.add_user("bob", "b").await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_seeded_from_config() {
        let config = BackendConfig {
            provisioning: Provisioning::Strict,
            update_buffer: 8,
            seed_users: vec![SeedUser {
                username: "carol".to_string(),
                password: "pw".to_string(),
            }],
        };
        let backend = MemoryBackend::from_config(&config);
        assert_eq!(backend.provisioning(), Provisioning::Strict);
        assert!(backend.login("carol", "pw").await.is_ok());
        assert!(backend.login("dave", "pw").await.is_err());
    }
}
