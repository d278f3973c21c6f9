#![warn(missing_docs)]

//! Management of HTTP Basic (`htpasswd`) and Digest (`htdigest`) credential files.
//!
//! The crate reconciles a desired credential, described by a [`DesiredState`],
//! against the file on disk: it can tell whether the file already holds the
//! entry with the right password and file policy, write the entry when it does
//! not, and remove it again.
//!
//! # Example
//!
//! ```no_run
//! use httpauth::{DesiredState, Mechanism, Provider};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Provider::new(DesiredState {
//!     file: "/etc/httpd/htdigest".into(),
//!     mechanism: Mechanism::Digest,
//!     realm: "admin".to_string(),
//!     user: "alice".to_string(),
//!     password: "secret".to_string(),
//!     mode: "0640".to_string(),
//!     owner: "root".to_string(),
//!     group: "www-data".to_string(),
//! });
//!
//! if !provider.reconcile()? {
//!     provider.create()?;
//! }
//! # Ok(())
//! # }
//! ```

mod apr1;
mod hash;
mod manifest;
mod mechanism;
mod policy;
mod provider;
mod store;

pub use hash::{BasicScheme, Error as HashError, detect_scheme, hash_for, verify};
pub use manifest::{Error as ManifestError, Manifest, Resource};
pub use mechanism::{Mechanism, UnknownMechanism};
pub use policy::{Error as PolicyError, FilePolicy};
pub use provider::{DesiredState, Ensure, Error, Outcome, Provider};
pub use store::{CredentialStore, Entry, Error as StoreError};

/// Broad classification of every error this crate returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An existing credential file could not be read or parsed.
    Format,
    /// Reading, writing or creating a file failed.
    Io,
    /// An owner or group name is unknown to the system.
    IdentityLookup,
    /// The process may not change the file's mode, ownership or contents.
    Permission,
    /// A mode string, user name or realm cannot be represented.
    InvalidInput,
    /// Password hashing failed.
    Hash,
}

/// Io errors caused by missing privileges are reported as [`ErrorKind::Permission`].
pub(crate) fn io_kind(error: &std::io::Error) -> ErrorKind {
    match error.kind() {
        std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
