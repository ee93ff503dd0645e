//! User store: authentication and sender authorization.
//!
//! The submission server consumes this purely through the [`UserStore`]
//! trait. The file-backed implementation reads a TOML list of users whose
//! passwords are Argon2 PHC digests. Every authentication failure collapses
//! into the same error value so the SMTP surface cannot be used as a
//! username oracle.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum UserStoreError {
    #[error("failed to read users from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse user file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The only error authentication ever reports.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid credentials")]
pub struct InvalidCredentials;

/// Credential checks consumed by the submission server.
pub trait UserStore: Send + Sync {
    /// Verifies a username/password pair.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCredentials`] for unknown users, undecodable digests
    /// and wrong passwords alike.
    fn authenticate(&self, username: &str, password: &str) -> Result<(), InvalidCredentials>;

    /// Whether the authenticated user may use `from` as envelope sender.
    fn is_valid_sender(&self, username: &str, from: &str) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Argon2 digest in PHC string format.
    pub password: String,
    /// The envelope sender this user is allowed to submit as.
    pub from: String,
}

#[derive(Debug, Deserialize)]
struct UserFile {
    #[serde(default)]
    user: Vec<UserRecord>,
}

/// File-backed [`UserStore`].
pub struct FileUserStore {
    users: HashMap<String, UserRecord>,
}

impl FileUserStore {
    /// Loads the user file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UserStoreError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| UserStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: UserFile = toml::from_str(&text)?;
        Ok(Self::from_records(file.user))
    }

    pub fn from_records(records: Vec<UserRecord>) -> Self {
        let users = records
            .into_iter()
            .map(|record| (record.username.clone(), record))
            .collect();
        Self { users }
    }
}

impl UserStore for FileUserStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<(), InvalidCredentials> {
        let Some(record) = self.users.get(username) else {
            warn!(username, "user not found");
            return Err(InvalidCredentials);
        };
        let digest = PasswordHash::new(&record.password).map_err(|err| {
            warn!(username, %err, "failed to decode password digest");
            InvalidCredentials
        })?;
        Argon2::default()
            .verify_password(password.as_bytes(), &digest)
            .map_err(|_| {
                warn!(username, "password does not match");
                InvalidCredentials
            })?;
        debug!(username, "user authenticated successfully");
        Ok(())
    }

    fn is_valid_sender(&self, username: &str, from: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|record| record.from == from)
    }
}
