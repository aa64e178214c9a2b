use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use tracing::{info, warn};

use parlor_db::{Database, StoreError};

use crate::blocking;

/// Registers users and verifies their passwords. Only an Argon2id digest
/// of each password is stored.
#[derive(Clone)]
pub struct CredentialStore {
    db: Arc<Database>,
    hasher: Argon2<'static>,
}

impl CredentialStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            hasher: Argon2::default(),
        }
    }

    pub fn with_hasher(mut self, hasher: Argon2<'static>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Store a new user. Fails with `DuplicateUsername` if the name is taken,
    /// leaving the existing user untouched.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let hasher = self.hasher.clone();
        let username = username.to_string();
        let password = password.to_string();
        let email = email.filter(|e| !e.is_empty()).map(str::to_string);

        blocking(move || {
            if db.get_user_by_username(&username)?.is_some() {
                return Err(StoreError::DuplicateUsername);
            }

            // Hashing is CPU-bound, keep it on the blocking pool too
            let salt = SaltString::generate(&mut OsRng);
            let digest = hasher
                .hash_password(password.as_bytes(), &salt)
                .map_err(|e| StoreError::Unavailable(format!("password hashing failed: {}", e)))?
                .to_string();

            let now = chrono::Utc::now().to_rfc3339();
            db.create_user(&username, &digest, email.as_deref(), &now)?;
            info!("Registered user {}", username);
            Ok(())
        })
        .await
    }

    /// Check a password against the stored digest. Unknown users and wrong
    /// passwords both yield `Ok(false)`.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let db = self.db.clone();
        let hasher = self.hasher.clone();
        let username = username.to_string();
        let password = password.to_string();

        blocking(move || {
            let Some(user) = db.get_user_by_username(&username)? else {
                return Ok(false);
            };

            let parsed = match PasswordHash::new(&user.password_digest) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Corrupt password digest for {}: {}", user.username, e);
                    return Ok(false);
                }
            };

            Ok(hasher.verify_password(password.as_bytes(), &parsed).is_ok())
        })
        .await
    }
}
