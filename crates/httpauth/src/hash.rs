use crate::apr1;
use crate::mechanism::Mechanism;
use md5::{Digest, Md5};
use snafu::Snafu;

/// Alphabet of crypt(3) salts and of the `./0-9A-Za-z` base64 variant.
pub(crate) const CRYPT_ALPHABET: &[u8; 64] =
    b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const DES_SALT_LEN: usize = 2;
const BCRYPT_PREFIX: &str = "$2";
const SHA256_PREFIX: &str = "$5$";
const SHA512_PREFIX: &str = "$6$";

/// Errors that can occur while producing a password hash.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The OS random source could not provide a salt.
    #[snafu(display("Failed to generate salt: {message}"))]
    Salt { message: String },

    /// DES-crypt refused the input.
    #[snafu(display("Failed to crypt password: {message}"))]
    Crypt { message: String },
}

/// The hash family of a value stored in a Basic (`htpasswd`) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicScheme {
    /// Traditional 13-character DES crypt, salt in the first two characters.
    DesCrypt,
    /// Apache `$apr1$` MD5-crypt.
    Apr1,
    /// `$2a$`, `$2b$` or `$2y$` bcrypt.
    Bcrypt,
    /// `$5$` SHA-256-crypt.
    Sha256Crypt,
    /// `$6$` SHA-512-crypt.
    Sha512Crypt,
}

/// Classifies a stored Basic hash by its prefix.
///
/// Anything without a recognised `$` prefix is treated as DES crypt, which is
/// what this crate writes.
pub fn detect_scheme(stored: &str) -> BasicScheme {
    if stored.starts_with(apr1::PREFIX) {
        BasicScheme::Apr1
    } else if stored.starts_with(BCRYPT_PREFIX) {
        BasicScheme::Bcrypt
    } else if stored.starts_with(SHA256_PREFIX) {
        BasicScheme::Sha256Crypt
    } else if stored.starts_with(SHA512_PREFIX) {
        BasicScheme::Sha512Crypt
    } else {
        BasicScheme::DesCrypt
    }
}

fn digest_hex(realm: &str, user: &str, password: &str) -> String {
    let digest = Md5::new()
        .chain_update(user.as_bytes())
        .chain_update(b":")
        .chain_update(realm.as_bytes())
        .chain_update(b":")
        .chain_update(password.as_bytes())
        .finalize();
    format!("{digest:x}")
}

fn random_salt() -> Result<String, Error> {
    let mut bytes = [0u8; DES_SALT_LEN];
    getrandom::fill(&mut bytes).map_err(|e| {
        SaltSnafu {
            message: e.to_string(),
        }
        .build()
    })?;
    // 64 divides 256, so the reduction is unbiased.
    Ok(bytes
        .iter()
        .map(|b| CRYPT_ALPHABET[usize::from(*b) % CRYPT_ALPHABET.len()] as char)
        .collect())
}

fn des_crypt(password: &str, salt: &str) -> Result<String, Error> {
    pwhash::unix_crypt::hash_with(salt, password).map_err(|e| {
        CryptSnafu {
            message: e.to_string(),
        }
        .build()
    })
}

fn is_salt(candidate: &str) -> bool {
    candidate.len() == DES_SALT_LEN && candidate.bytes().all(|b| CRYPT_ALPHABET.contains(&b))
}

/// Computes the value to store for `user` in `realm`.
///
/// Digest hashes are deterministic. Basic hashes use a fresh random salt, so
/// two calls with the same password give different results.
pub fn hash_for(
    mechanism: Mechanism,
    realm: &str,
    user: &str,
    password: &str,
) -> Result<String, Error> {
    match mechanism {
        Mechanism::Digest => Ok(digest_hex(realm, user, password)),
        Mechanism::Basic => des_crypt(password, &random_salt()?),
    }
}

/// Checks `password` against a stored hash.
///
/// A stored value that cannot be interpreted is a mismatch rather than an
/// error: the caller only needs to know whether the entry has to be rewritten.
pub fn verify(mechanism: Mechanism, realm: &str, user: &str, password: &str, stored: &str) -> bool {
    match mechanism {
        Mechanism::Digest => digest_hex(realm, user, password) == stored,
        Mechanism::Basic => match detect_scheme(stored) {
            BasicScheme::DesCrypt => {
                // Re-crypt with the stored salt; a fresh one would never match.
                let Some(salt) = stored.get(..DES_SALT_LEN).filter(|s| is_salt(s)) else {
                    return false;
                };
                des_crypt(password, salt).is_ok_and(|computed| computed == stored)
            }
            BasicScheme::Apr1 => apr1::verify(password, stored),
            BasicScheme::Bcrypt => bcrypt::verify(password, stored).unwrap_or(false),
            BasicScheme::Sha256Crypt => pwhash::sha256_crypt::verify(password, stored),
            BasicScheme::Sha512Crypt => pwhash::sha512_crypt::verify(password, stored),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        // md5("alice:admin:secret")
        let hash = hash_for(Mechanism::Digest, "admin", "alice", "secret").unwrap();
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, format!("{:x}", Md5::digest(b"alice:admin:secret")));
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_digest_is_deterministic_and_realm_bound() {
        let first = hash_for(Mechanism::Digest, "admin", "alice", "secret").unwrap();
        let second = hash_for(Mechanism::Digest, "admin", "alice", "secret").unwrap();
        assert_eq!(first, second);
        assert!(verify(Mechanism::Digest, "admin", "alice", "secret", &first));
        assert!(!verify(Mechanism::Digest, "users", "alice", "secret", &first));
        assert!(!verify(Mechanism::Digest, "admin", "bob", "secret", &first));
        assert!(!verify(Mechanism::Digest, "admin", "alice", "wrong", &first));
    }

    #[test]
    fn test_basic_salts_differ_but_both_verify() {
        // 4096 possible salts; retry a few times to keep a collision from flaking.
        let first = hash_for(Mechanism::Basic, "", "alice", "secret").unwrap();
        let second = (0..8)
            .map(|_| hash_for(Mechanism::Basic, "", "alice", "secret").unwrap())
            .find(|h| *h != first)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(first.len(), 13);
        assert!(verify(Mechanism::Basic, "", "alice", "secret", &first));
        assert!(verify(Mechanism::Basic, "", "alice", "secret", &second));
        assert!(!verify(Mechanism::Basic, "", "alice", "wrong", &first));
    }

    #[test]
    fn test_basic_ignores_realm() {
        let stored = hash_for(Mechanism::Basic, "one", "alice", "secret").unwrap();
        assert!(verify(Mechanism::Basic, "two", "alice", "secret", &stored));
    }

    #[test]
    fn test_basic_des_known_value() {
        // crypt("password", "ab") from glibc.
        assert!(verify(Mechanism::Basic, "", "u", "password", "abJnggxhB/yWI"));
        assert!(!verify(Mechanism::Basic, "", "u", "passwore", "abJnggxhB/yWI"));
    }

    #[test]
    fn test_basic_malformed_stored_value_is_mismatch() {
        assert!(!verify(Mechanism::Basic, "", "u", "password", ""));
        assert!(!verify(Mechanism::Basic, "", "u", "password", "a"));
        assert!(!verify(Mechanism::Basic, "", "u", "password", "!!garbage"));
    }

    #[test]
    fn test_basic_foreign_schemes() {
        let bcrypt_hash = bcrypt::hash("testpass123", 4).unwrap();
        assert_eq!(detect_scheme(&bcrypt_hash), BasicScheme::Bcrypt);
        assert!(verify(Mechanism::Basic, "", "u", "testpass123", &bcrypt_hash));
        assert!(!verify(Mechanism::Basic, "", "u", "wrongpass", &bcrypt_hash));

        // htpasswd -nb2 testuser testpass123
        let sha256 = "$5$6.O43dJ8bymsjcrp$QzfN4hZywImpvc6uE0O8TR.Xe87tgyvATwyV61rQbR5";
        assert_eq!(detect_scheme(sha256), BasicScheme::Sha256Crypt);
        assert!(verify(Mechanism::Basic, "", "u", "testpass123", sha256));
        assert!(!verify(Mechanism::Basic, "", "u", "wrongpass", sha256));

        // htpasswd -nb5 testuser testpass123
        let sha512 = "$6$On58VpHvsS95KvxU$lbtz65RFxG2fcos.C3vi2wllW82efo8fDcO2PRVEnHwKpvS4tGE4OJ6He98QevZYUrenCYl9QiG0woAexDYkZ/";
        assert_eq!(detect_scheme(sha512), BasicScheme::Sha512Crypt);
        assert!(verify(Mechanism::Basic, "", "u", "testpass123", sha512));

        let apr1 = "$apr1$WxrZ8P3I$XD2BykvOa82I1l5jCMtbW0";
        assert_eq!(detect_scheme(apr1), BasicScheme::Apr1);
        assert!(verify(Mechanism::Basic, "", "u", "testpass123", apr1));
    }

    #[test]
    fn test_detect_scheme_defaults_to_des() {
        assert_eq!(detect_scheme("abJnggxhB/yWI"), BasicScheme::DesCrypt);
        assert_eq!(detect_scheme(""), BasicScheme::DesCrypt);
    }
}
