use crate::ErrorKind;
use nix::unistd::{Gid, Group, Uid, User};
use snafu::{OptionExt, ResultExt, Snafu};
use std::fs::{self, File, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Errors that can occur while checking or applying file policy.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The user database could not be queried.
    #[snafu(display("Failed to look up user '{name}'"))]
    UserLookup { source: nix::Error, name: String },

    /// No such user.
    #[snafu(display("User '{name}' does not exist"))]
    UnknownUser { name: String },

    /// The group database could not be queried.
    #[snafu(display("Failed to look up group '{name}'"))]
    GroupLookup { source: nix::Error, name: String },

    /// No such group.
    #[snafu(display("Group '{name}' does not exist"))]
    UnknownGroup { name: String },

    /// The mode is not an octal permission value.
    #[snafu(display("Invalid file mode '{mode}', expected octal digits such as 0640"))]
    InvalidMode { mode: String },

    /// Failed to stat the file.
    #[snafu(display("Failed to stat '{}'", path.display()))]
    Stat {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to open the file.
    #[snafu(display("Failed to open '{}'", path.display()))]
    Open {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to change permission bits.
    #[snafu(display("Failed to set mode {mode:o} on '{}'", path.display()))]
    Chmod {
        source: std::io::Error,
        path: PathBuf,
        mode: u32,
    },

    /// Failed to change ownership.
    #[snafu(display("Failed to change ownership of '{}' to {owner}:{group}", path.display()))]
    Chown {
        source: std::io::Error,
        path: PathBuf,
        owner: String,
        group: String,
    },
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UserLookup { .. }
            | Error::UnknownUser { .. }
            | Error::GroupLookup { .. }
            | Error::UnknownGroup { .. } => ErrorKind::IdentityLookup,
            Error::InvalidMode { .. } => ErrorKind::InvalidInput,
            Error::Stat { source, .. }
            | Error::Open { source, .. }
            | Error::Chmod { source, .. }
            | Error::Chown { source, .. } => crate::io_kind(source),
        }
    }
}

/// Permission bits and ownership a credential file should have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePolicy<'a> {
    /// Octal permission string, e.g. `0640`.
    pub mode: &'a str,
    /// Owning user name.
    pub owner: &'a str,
    /// Owning group name.
    pub group: &'a str,
}

impl<'a> FilePolicy<'a> {
    /// Creates a policy from its three components.
    pub fn new(mode: &'a str, owner: &'a str, group: &'a str) -> Self {
        Self { mode, owner, group }
    }

    fn uid(&self) -> Result<Uid, Error> {
        let name = self.owner;
        let user = User::from_name(name)
            .context(UserLookupSnafu { name })?
            .context(UnknownUserSnafu { name })?;
        Ok(user.uid)
    }

    fn gid(&self) -> Result<Gid, Error> {
        let name = self.group;
        let group = Group::from_name(name)
            .context(GroupLookupSnafu { name })?
            .context(UnknownGroupSnafu { name })?;
        Ok(group.gid)
    }

    /// Permission bits of the configured mode. A regular file type prefix, as
    /// in `"100644"`, is accepted and dropped.
    fn octal_mode(&self) -> Result<u32, Error> {
        let mode = self.mode;
        let valid = !mode.is_empty() && mode.bytes().all(|b| (b'0'..=b'7').contains(&b));
        let value = valid
            .then(|| u32::from_str_radix(mode, 8).ok())
            .flatten()
            .filter(|value| matches!(value & !0o7777, 0 | 0o100000))
            .map(|value| value & 0o7777);
        value.context(InvalidModeSnafu { mode })
    }

    /// Whether `path` exists with this mode, owner and group.
    ///
    /// The mode matches when the file's full `st_mode`, file type bits included,
    /// rendered in octal ends with the configured string. `"644"`, `"0644"` and
    /// `"100644"` all match a regular file with permissions 0644.
    pub fn check(&self, path: &Path) -> Result<bool, Error> {
        self.octal_mode()?;
        if !path.exists() {
            return Ok(false);
        }
        let uid = self.uid()?;
        let gid = self.gid()?;
        let metadata = fs::metadata(path).context(StatSnafu { path })?;

        let mode_ok = format!("{:o}", metadata.mode()).ends_with(self.mode);
        let owner_ok = metadata.uid() == uid.as_raw();
        let group_ok = metadata.gid() == gid.as_raw();
        tracing::debug!(
            path = %path.display(),
            mode_ok,
            owner_ok,
            group_ok,
            "Checked file policy"
        );
        Ok(mode_ok && owner_ok && group_ok)
    }

    /// Sets the mode, owner and group of `path`. File contents are untouched.
    pub fn apply(&self, path: &Path) -> Result<(), Error> {
        let mode = self.octal_mode()?;
        let uid = self.uid()?;
        let gid = self.gid()?;

        let file = File::open(path).context(OpenSnafu { path })?;
        file.set_permissions(Permissions::from_mode(mode))
            .context(ChmodSnafu { path, mode })?;
        std::os::unix::fs::fchown(&file, Some(uid.as_raw()), Some(gid.as_raw())).context(
            ChownSnafu {
                path,
                owner: self.owner,
                group: self.group,
            },
        )?;
        tracing::info!(
            path = %path.display(),
            mode = %format!("{mode:04o}"),
            owner = self.owner,
            group = self.group,
            "Applied file policy"
        );
        Ok(())
    }
}
