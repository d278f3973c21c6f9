use crate::ErrorKind;
use crate::hash::{self, hash_for, verify};
use crate::mechanism::Mechanism;
use crate::policy::{self, FilePolicy};
use crate::store::{self, CredentialStore, validate_key};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Errors returned by the reconciliation entry points.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Failed to materialise an empty credential file.
    #[snafu(display("Failed to create credential file '{}'", path.display()))]
    CreateFile {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Credential file operation failed.
    #[snafu(display("Credential file operation failed"))]
    Store { source: store::Error },

    /// File policy could not be checked or applied.
    #[snafu(display("File policy operation failed"))]
    Policy { source: policy::Error },

    /// Failed to hash password.
    #[snafu(display("Failed to hash password"))]
    Hash { source: hash::Error },
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CreateFile { source, .. } => crate::io_kind(source),
            Error::Store { source } => source.kind(),
            Error::Policy { source } => source.kind(),
            Error::Hash { .. } => ErrorKind::Hash,
        }
    }
}

/// A credential as it should exist on disk.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct DesiredState {
    /// Path of the `htpasswd`/`htdigest` file.
    pub file: PathBuf,
    /// File format and hashing scheme.
    pub mechanism: Mechanism,
    /// Protection space; only stored in Digest files.
    #[serde(default)]
    pub realm: String,
    /// User name.
    #[serde(alias = "name")]
    pub user: String,
    /// Plaintext password.
    pub password: String,
    /// Octal permission string for the file, e.g. `0640`.
    pub mode: String,
    /// Owning user name.
    pub owner: String,
    /// Owning group name.
    pub group: String,
}

impl std::fmt::Debug for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesiredState")
            .field("file", &self.file)
            .field("mechanism", &self.mechanism)
            .field("realm", &self.realm)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .field("group", &self.group)
            .finish()
    }
}

impl DesiredState {
    /// The mode/owner/group part of the state.
    pub fn policy(&self) -> FilePolicy<'_> {
        FilePolicy::new(&self.mode, &self.owner, &self.group)
    }
}

/// Whether a credential should be present in its file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    /// Entry written with the desired password and file policy.
    #[default]
    Present,
    /// Entry removed.
    Absent,
}

impl FromStr for Ensure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "present" => Ok(Ensure::Present),
            "absent" => Ok(Ensure::Absent),
            _ => Err(format!("expected 'present' or 'absent', got '{s}'")),
        }
    }
}

impl std::fmt::Display for Ensure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ensure::Present => write!(f, "present"),
            Ensure::Absent => write!(f, "absent"),
        }
    }
}

/// What [`Provider::sync`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The file already matched.
    Unchanged,
    /// The entry was written and the file policy applied.
    Created,
    /// The entry was removed.
    Removed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Unchanged => write!(f, "unchanged"),
            Outcome::Created => write!(f, "created"),
            Outcome::Removed => write!(f, "removed"),
        }
    }
}

/// Reconciles one [`DesiredState`] against the file system.
///
/// Every call re-reads the credential file; nothing is kept between calls.
#[derive(Debug, Clone)]
pub struct Provider {
    desired: DesiredState,
}

impl Provider {
    /// Wraps a desired state.
    pub fn new(desired: DesiredState) -> Self {
        Self { desired }
    }

    /// The desired state being reconciled.
    pub fn desired(&self) -> &DesiredState {
        &self.desired
    }

    fn path(&self) -> &Path {
        &self.desired.file
    }

    fn open(&self) -> Result<CredentialStore, Error> {
        CredentialStore::open(self.path(), self.desired.mechanism).context(StoreSnafu)
    }

    /// Creates an empty credential file if there is none. Returns whether it did.
    fn ensure_file(&self) -> Result<bool, Error> {
        let path = self.path();
        if path.exists() {
            return Ok(false);
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context(CreateFileSnafu { path })?;
        tracing::info!(path = %path.display(), "Created empty credential file");
        Ok(true)
    }

    /// Whether the file already holds the entry with the desired password,
    /// mode, owner and group.
    ///
    /// A missing file is created empty on the way, so that a later
    /// [`create`](Self::create) has something to open.
    pub fn reconcile(&self) -> Result<bool, Error> {
        let DesiredState {
            mechanism,
            realm,
            user,
            password,
            ..
        } = &self.desired;
        let path = self.path();

        if self.ensure_file()? {
            // The fresh file must still open as a credential file.
            let _store = self.open()?;
            tracing::debug!(path = %path.display(), user = %user, "Credential file was missing");
            return Ok(false);
        }

        let store = self.open()?;
        let Some(stored) = store.get(realm, user) else {
            tracing::debug!(path = %path.display(), user = %user, realm = %realm, "No entry for user");
            return Ok(false);
        };
        if !verify(*mechanism, realm, user, password, stored) {
            tracing::debug!(path = %path.display(), user = %user, realm = %realm, "Password does not match");
            return Ok(false);
        }

        let satisfied = self.desired.policy().check(path).context(PolicySnafu)?;
        tracing::debug!(path = %path.display(), user = %user, realm = %realm, satisfied, "Entry matches");
        Ok(satisfied)
    }

    /// Writes the entry and then applies the file policy.
    ///
    /// A stored hash that already verifies is kept as is, so running this twice
    /// leaves the file byte-for-byte unchanged even for salted Basic hashes.
    pub fn create(&self) -> Result<(), Error> {
        let DesiredState {
            mechanism,
            realm,
            user,
            password,
            ..
        } = &self.desired;
        let path = self.path();

        validate_key(*mechanism, realm, user).context(StoreSnafu)?;
        self.ensure_file()?;

        let mut store = self.open()?;
        let hash = match store.get(realm, user) {
            Some(stored) if verify(*mechanism, realm, user, password, stored) => stored.to_string(),
            _ => hash_for(*mechanism, realm, user, password).context(HashSnafu)?,
        };
        store.set(realm, user, &hash).context(StoreSnafu)?;
        store.flush().context(StoreSnafu)?;
        tracing::info!(path = %path.display(), user = %user, realm = %realm, %mechanism, "Wrote credential");

        self.desired.policy().apply(path).context(PolicySnafu)
    }

    /// Removes the entry. File policy is left alone.
    pub fn destroy(&self) -> Result<(), Error> {
        let DesiredState { realm, user, .. } = &self.desired;
        let path = self.path();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No credential file, nothing to remove");
            return Ok(());
        }
        let mut store = self.open()?;
        if store.delete(realm, user) {
            store.flush().context(StoreSnafu)?;
            tracing::info!(path = %path.display(), user = %user, realm = %realm, "Removed credential");
        }
        Ok(())
    }

    /// Whether the file currently has an entry for the user, whatever its password.
    fn has_entry(&self) -> Result<bool, Error> {
        if !self.path().exists() {
            return Ok(false);
        }
        let store = self.open()?;
        Ok(store.get(&self.desired.realm, &self.desired.user).is_some())
    }

    /// Brings the file to `ensure`, doing only what is needed.
    pub fn sync(&self, ensure: Ensure) -> Result<Outcome, Error> {
        match ensure {
            Ensure::Present => {
                if self.reconcile()? {
                    Ok(Outcome::Unchanged)
                } else {
                    self.create()?;
                    Ok(Outcome::Created)
                }
            }
            Ensure::Absent => {
                if self.has_entry()? {
                    self.destroy()?;
                    Ok(Outcome::Removed)
                } else {
                    Ok(Outcome::Unchanged)
                }
            }
        }
    }
}
