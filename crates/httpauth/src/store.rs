use crate::ErrorKind;
use crate::mechanism::Mechanism;
use snafu::{ResultExt, Snafu};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Errors that can occur during credential file operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Failed to open the credential file.
    #[snafu(display("Failed to open credential file '{}'", path.display()))]
    FileOpen {
        source: std::io::Error,
        path: PathBuf,
    },

    /// The path exists but is a directory, socket or similar.
    #[snafu(display("Credential file '{}' is not a regular file", path.display()))]
    NotRegularFile { path: PathBuf },

    /// Failed to read from the credential file.
    #[snafu(display("Failed to read credential file '{}'", path.display()))]
    FileRead {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to create the temporary file used for saving.
    #[snafu(display("Failed to create temporary file in '{}'", dir.display()))]
    TempFile {
        source: std::io::Error,
        dir: PathBuf,
    },

    /// Failed to write the new contents.
    #[snafu(display("Failed to save credential file '{}'", path.display()))]
    FileSave {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to move the temporary file over the credential file.
    #[snafu(display("Failed to replace credential file '{}'", path.display()))]
    FileReplace {
        source: std::io::Error,
        path: PathBuf,
    },

    /// User name cannot be empty.
    #[snafu(display("User name cannot be empty"))]
    UserEmpty,

    /// A user name or realm contains a field separator or line break.
    #[snafu(display("{field} '{value}' contains ':' or a line break"))]
    InvalidCharacter { field: &'static str, value: String },

    /// A user name starting with `#` would be read back as a comment.
    #[snafu(display("User name '{user}' cannot start with '#'"))]
    CommentUser { user: String },
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FileOpen { .. } | Error::NotRegularFile { .. } | Error::FileRead { .. } => {
                ErrorKind::Format
            }
            Error::TempFile { source, .. }
            | Error::FileSave { source, .. }
            | Error::FileReplace { source, .. } => crate::io_kind(source),
            Error::UserEmpty | Error::InvalidCharacter { .. } | Error::CommentUser { .. } => {
                ErrorKind::InvalidInput
            }
        }
    }
}

/// An addressable credential line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    /// User name, the first field.
    pub user: &'a str,
    /// Realm; always `None` in Basic files.
    pub realm: Option<&'a str>,
    /// Stored hash, the last field.
    pub hash: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry {
        user: String,
        realm: Option<String>,
        hash: String,
    },
    /// Blank, comment or malformed line, written back untouched.
    Raw(String),
}

impl Line {
    fn parse(mechanism: Mechanism, text: &str) -> Self {
        let fields: Vec<&str> = text.splitn(mechanism.field_count(), ':').collect();
        if fields.len() != mechanism.field_count() || fields[0].is_empty() || fields[0].starts_with('#')
        {
            return Line::Raw(text.to_string());
        }
        match mechanism {
            Mechanism::Basic => Line::Entry {
                user: fields[0].to_string(),
                realm: None,
                hash: fields[1].to_string(),
            },
            Mechanism::Digest => Line::Entry {
                user: fields[0].to_string(),
                realm: Some(fields[1].to_string()),
                hash: fields[2].to_string(),
            },
        }
    }

    fn matches(&self, realm: Option<&str>, user: &str) -> bool {
        match self {
            Line::Entry {
                user: u, realm: r, ..
            } => u == user && r.as_deref() == realm,
            Line::Raw(_) => false,
        }
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Line::Entry {
                user,
                realm: Some(realm),
                hash,
            } => {
                out.push_str(user);
                out.push(':');
                out.push_str(realm);
                out.push(':');
                out.push_str(hash);
            }
            Line::Entry {
                user,
                realm: None,
                hash,
            } => {
                out.push_str(user);
                out.push(':');
                out.push_str(hash);
            }
            Line::Raw(text) => out.push_str(text),
        }
        out.push('\n');
    }
}

/// Rejects a user or realm that would corrupt the line format.
pub(crate) fn validate_key(mechanism: Mechanism, realm: &str, user: &str) -> Result<(), Error> {
    let bad = |s: &str| s.contains([':', '\n', '\r']);
    snafu::ensure!(!user.is_empty(), UserEmptySnafu);
    snafu::ensure!(!user.starts_with('#'), CommentUserSnafu { user });
    snafu::ensure!(
        !bad(user),
        InvalidCharacterSnafu {
            field: "User name",
            value: user
        }
    );
    if mechanism == Mechanism::Digest {
        snafu::ensure!(
            !bad(realm),
            InvalidCharacterSnafu {
                field: "Realm",
                value: realm
            }
        );
    }
    Ok(())
}

/// An `htpasswd` or `htdigest` file loaded into memory.
///
/// The store never caches anything across calls: open it, make the changes,
/// [`flush`](Self::flush) and drop it.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    mechanism: Mechanism,
    lines: Vec<Line>,
}

impl CredentialStore {
    /// Reads an existing credential file. The file is never created here.
    pub fn open(path: impl AsRef<Path>, mechanism: Mechanism) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).context(FileOpenSnafu { path })?;
        let metadata = file.metadata().context(FileReadSnafu { path })?;
        snafu::ensure!(metadata.is_file(), NotRegularFileSnafu { path });

        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context(FileReadSnafu { path })?;
            lines.push(Line::parse(mechanism, &line));
        }

        let store = Self {
            path: path.to_path_buf(),
            mechanism,
            lines,
        };
        tracing::debug!(
            path = %path.display(),
            %mechanism,
            entries = store.len(),
            other_lines = store.lines.len() - store.len(),
            "Loaded credential file"
        );
        Ok(store)
    }

    /// Realm as stored in this file's format.
    fn realm_key<'a>(&self, realm: &'a str) -> Option<&'a str> {
        match self.mechanism {
            Mechanism::Basic => None,
            Mechanism::Digest => Some(realm),
        }
    }

    /// Returns the stored hash for `user` in `realm`.
    ///
    /// Basic files have no realm field, so `realm` is ignored for them. If the
    /// key appears more than once the last line wins.
    pub fn get(&self, realm: &str, user: &str) -> Option<&str> {
        let realm = self.realm_key(realm);
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { hash, .. } if line.matches(realm, user) => Some(hash.as_str()),
            _ => None,
        })
    }

    /// Inserts or replaces the hash for `user` in `realm`.
    ///
    /// An existing entry is updated in place and any duplicates of it are
    /// dropped; a new entry is appended.
    pub fn set(&mut self, realm: &str, user: &str, hash: &str) -> Result<(), Error> {
        validate_key(self.mechanism, realm, user)?;
        let key = self.realm_key(realm);

        let mut kept = false;
        self.lines.retain_mut(|line| {
            if !line.matches(key, user) {
                return true;
            }
            if kept {
                return false;
            }
            if let Line::Entry { hash: stored, .. } = line {
                *stored = hash.to_string();
            }
            kept = true;
            true
        });

        if !kept {
            self.lines.push(Line::Entry {
                user: user.to_string(),
                realm: key.map(str::to_string),
                hash: hash.to_string(),
            });
        }
        Ok(())
    }

    /// Removes `user` in `realm`. Returns whether anything was removed.
    pub fn delete(&mut self, realm: &str, user: &str) -> bool {
        let key = self.realm_key(realm);
        let before = self.lines.len();
        self.lines.retain(|line| !line.matches(key, user));
        before != self.lines.len()
    }

    /// Iterates over the addressable entries in file order.
    pub fn entries(&self) -> impl Iterator<Item = Entry<'_>> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry { user, realm, hash } => Some(Entry {
                user,
                realm: realm.as_deref(),
                hash,
            }),
            Line::Raw(_) => None,
        })
    }

    /// Number of addressable entries.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Whether the file holds no addressable entries.
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Get the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the file format.
    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            line.write_to(&mut out);
        }
        out
    }

    /// Writes every line back to disk.
    ///
    /// The contents go to a temporary file next to the target which takes over
    /// the target's mode and ownership and is then renamed over it. A symlinked
    /// path is resolved first so the link keeps pointing at the rewritten file.
    pub fn flush(&self) -> Result<(), Error> {
        let target = match fs::canonicalize(&self.path) {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.path.clone(),
            Err(e) => return Err(e).context(FileSaveSnafu { path: &self.path }),
        };
        let path = target.as_path();
        let contents = self.render();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let original = fs::metadata(path).ok();

        let mut tmp = tempfile::Builder::new()
            .prefix(".httpauth-")
            .tempfile_in(dir)
            .context(TempFileSnafu { dir })?;
        tmp.write_all(contents.as_bytes())
            .context(FileSaveSnafu { path })?;

        if let Some(original) = &original {
            let file = tmp.as_file();
            file.set_permissions(original.permissions())
                .context(FileSaveSnafu { path })?;
            let current = file.metadata().context(FileSaveSnafu { path })?;
            if (current.uid(), current.gid()) != (original.uid(), original.gid()) {
                match std::os::unix::fs::fchown(file, Some(original.uid()), Some(original.gid())) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                        tracing::warn!(
                            path = %path.display(),
                            "Cannot preserve ownership through a rename, rewriting in place"
                        );
                        drop(tmp);
                        return self.rewrite_in_place(&contents);
                    }
                    Err(e) => return Err(e).context(FileSaveSnafu { path }),
                }
            }
        }

        tmp.as_file().sync_all().context(FileSaveSnafu { path })?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .context(FileReplaceSnafu { path })?;
        tracing::debug!(path = %path.display(), lines = self.lines.len(), "Saved credential file");
        Ok(())
    }

    fn rewrite_in_place(&self, contents: &str) -> Result<(), Error> {
        let path = self.path.as_path();
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .context(FileSaveSnafu { path })?;
        file.write_all(contents.as_bytes())
            .context(FileSaveSnafu { path })?;
        file.sync_all().context(FileSaveSnafu { path })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const DIGEST_FIXTURE: &str = "\
# managed elsewhere
alice:admin:0123456789abcdef0123456789abcdef
bob:admin:fedcba9876543210fedcba9876543210
not a credential line

alice:users:00000000000000000000000000000000
";

    fn fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = CredentialStore::open(dir.path().join("absent"), Mechanism::Basic);
        let err = result.unwrap_err();
        assert!(matches!(err, Error::FileOpen { .. }));
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(!dir.path().join("absent").exists());
    }

    #[test]
    fn test_open_directory_fails() {
        let dir = tempdir().unwrap();
        let err = CredentialStore::open(dir.path(), Mechanism::Digest).unwrap_err();
        assert!(matches!(
            err,
            Error::NotRegularFile { .. } | Error::FileRead { .. }
        ));
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_open_non_utf8_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("binary");
        fs::write(&path, [0xff, 0xfe, b':', 0x00, b'\n']).unwrap();
        let err = CredentialStore::open(&path, Mechanism::Basic).unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }

    #[test]
    fn test_digest_lookup_is_keyed_by_realm() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htdigest", DIGEST_FIXTURE);

        let store = CredentialStore::open(&path, Mechanism::Digest).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(
            store.get("admin", "alice"),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(
            store.get("users", "alice"),
            Some("00000000000000000000000000000000")
        );
        assert_eq!(store.get("users", "bob"), None);
        assert_eq!(store.get("admin", "carol"), None);
    }

    #[test]
    fn test_basic_lookup_ignores_realm() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htpasswd", "alice:abJnggxhB/yWI\n");

        let store = CredentialStore::open(&path, Mechanism::Basic).unwrap();
        assert_eq!(store.get("", "alice"), Some("abJnggxhB/yWI"));
        assert_eq!(store.get("anything", "alice"), Some("abJnggxhB/yWI"));
        assert_eq!(store.entries().next().unwrap().realm, None);
    }

    #[test]
    fn test_basic_hash_may_contain_colons() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htpasswd", "alice:odd:hash\n");
        let store = CredentialStore::open(&path, Mechanism::Basic).unwrap();
        assert_eq!(store.get("", "alice"), Some("odd:hash"));
    }

    #[test]
    fn test_malformed_lines_survive_flush() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htdigest", DIGEST_FIXTURE);

        let mut store = CredentialStore::open(&path, Mechanism::Digest).unwrap();
        store.set("admin", "bob", "11111111111111111111111111111111").unwrap();
        store.flush().unwrap();

        let expected = DIGEST_FIXTURE.replace(
            "bob:admin:fedcba9876543210fedcba9876543210",
            "bob:admin:11111111111111111111111111111111",
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), expected);
    }

    #[test]
    fn test_set_appends_new_entry() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htdigest", "");

        let mut store = CredentialStore::open(&path, Mechanism::Digest).unwrap();
        assert!(store.is_empty());
        store.set("admin", "alice", "aa").unwrap();
        store.set("admin", "bob", "bb").unwrap();
        store.flush().unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "alice:admin:aa\nbob:admin:bb\n"
        );
    }

    #[test]
    fn test_repeated_set_keeps_one_entry() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htpasswd", "alice:one\nbob:two\nalice:three\n");

        let mut store = CredentialStore::open(&path, Mechanism::Basic).unwrap();
        // Duplicates on disk: the last one is authoritative.
        assert_eq!(store.get("", "alice"), Some("three"));
        store.set("", "alice", "four").unwrap();
        store.set("", "alice", "five").unwrap();
        store.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "alice:five\nbob:two\n");
    }

    #[test]
    fn test_set_rejects_separators() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htdigest", "");
        let mut store = CredentialStore::open(&path, Mechanism::Digest).unwrap();

        let err = store.set("admin", "ali:ce", "aa").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(store.set("ad\nmin", "alice", "aa").is_err());
        assert!(matches!(
            store.set("admin", "", "aa"),
            Err(Error::UserEmpty)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_rejects_comment_user() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htdigest", "");
        let mut store = CredentialStore::open(&path, Mechanism::Digest).unwrap();

        let err = store.set("admin", "#ops", "aa").unwrap_err();
        assert!(matches!(err, Error::CommentUser { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(store.is_empty());

        // Only a leading '#' is a comment marker.
        store.set("admin", "ops#1", "aa").unwrap();
        store.flush().unwrap();
        let store = CredentialStore::open(&path, Mechanism::Digest).unwrap();
        assert_eq!(store.get("admin", "ops#1"), Some("aa"));
    }

    #[test]
    fn test_basic_realm_is_not_validated() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htpasswd", "");
        let mut store = CredentialStore::open(&path, Mechanism::Basic).unwrap();
        store.set("realm:with:colons", "alice", "hash").unwrap();
        assert_eq!(store.get("", "alice"), Some("hash"));
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htdigest", DIGEST_FIXTURE);

        let mut store = CredentialStore::open(&path, Mechanism::Digest).unwrap();
        assert!(!store.delete("other", "alice"));
        store.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DIGEST_FIXTURE);

        assert!(store.delete("admin", "alice"));
        store.flush().unwrap();

        let store = CredentialStore::open(&path, Mechanism::Digest).unwrap();
        assert_eq!(store.get("admin", "alice"), None);
        assert!(store.get("users", "alice").is_some());
        assert!(store.get("admin", "bob").is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_flush_preserves_mode() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htpasswd", "");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        let mut store = CredentialStore::open(&path, Mechanism::Basic).unwrap();
        store.set("", "alice", "hash").unwrap();
        store.flush().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o640);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "temporary file left behind: {leftovers:?}");
    }

    #[test]
    fn test_flush_through_symlink_rewrites_target() {
        let dir = tempdir().unwrap();
        let real = fixture(dir.path(), "real", "bob:old\n");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut store = CredentialStore::open(&link, Mechanism::Basic).unwrap();
        store.set("", "alice", "hash").unwrap();
        store.flush().unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&real).unwrap(), "bob:old\nalice:hash\n");
        assert_eq!(store.path(), link.as_path());
    }

    #[test]
    fn test_crlf_lines_are_normalised() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "htpasswd", "alice:hash\r\nbob:other\r\n");
        let store = CredentialStore::open(&path, Mechanism::Basic).unwrap();
        assert_eq!(store.get("", "alice"), Some("hash"));
        store.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "alice:hash\nbob:other\n");
    }
}
