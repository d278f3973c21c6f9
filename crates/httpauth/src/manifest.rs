//! TOML manifests declaring many credentials at once.
//!
//! ```toml
//! [[credential]]
//! file = "/etc/httpd/htdigest"
//! mechanism = "digest"
//! realm = "admin"
//! name = "alice"
//! password = "secret"
//! mode = "0640"
//! owner = "root"
//! group = "www-data"
//! ensure = "present"
//! ```

use crate::provider::{self, DesiredState, Ensure, Outcome, Provider};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};

/// Errors that can occur while loading or applying a manifest.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Failed to read the manifest.
    #[snafu(display("Failed to read manifest '{}'", path.display()))]
    Read {
        source: std::io::Error,
        path: PathBuf,
    },

    /// The manifest is not valid TOML or has unexpected fields.
    #[snafu(display("Failed to parse manifest '{}'", path.display()))]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },

    /// Applying one resource failed; earlier resources stay applied.
    #[snafu(display("Failed to apply credential '{user}' in '{}'", file.display()))]
    Apply {
        source: provider::Error,
        user: String,
        file: PathBuf,
    },
}

/// A credential together with whether it should exist.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Resource {
    /// Defaults to present.
    #[serde(default)]
    pub ensure: Ensure,
    /// The credential itself.
    #[serde(flatten)]
    pub state: DesiredState,
}

/// An ordered list of credential resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Resources in application order.
    #[serde(default, rename = "credential")]
    pub credentials: Vec<Resource>,
}

impl Manifest {
    /// Reads and parses a manifest file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let manifest: Self = toml::from_str(&text).context(ParseSnafu { path })?;
        tracing::debug!(
            path = %path.display(),
            resources = manifest.credentials.len(),
            "Loaded manifest"
        );
        Ok(manifest)
    }

    /// Syncs every resource in order, stopping at the first failure.
    pub fn apply(&self) -> Result<Vec<Outcome>, Error> {
        self.credentials
            .iter()
            .map(|resource| {
                let provider = Provider::new(resource.state.clone());
                provider.sync(resource.ensure).context(ApplySnafu {
                    user: resource.state.user.as_str(),
                    file: resource.state.file.as_path(),
                })
            })
            .collect()
    }
}
