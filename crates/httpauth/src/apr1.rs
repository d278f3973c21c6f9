//! Verification of Apache's `$apr1$` MD5-crypt hashes.
//!
//! Basic credential files edited with Apache `htpasswd -m` carry entries of the
//! form `$apr1$<salt>$<digest>`. New entries are never written in this format;
//! it only has to be recognised so that such entries reconcile.

use md5::{Digest, Md5};

pub(crate) const PREFIX: &str = "$apr1$";

const MAX_SALT_LEN: usize = 8;
const ROUNDS: usize = 1000;

/// Digest byte triples in the order Apache serialises them.
const GROUPS: [(usize, usize, usize); 5] = [(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)];

fn push_b64(out: &mut String, mut value: u32, chars: usize) {
    for _ in 0..chars {
        out.push(crate::hash::CRYPT_ALPHABET[(value & 0x3f) as usize] as char);
        value >>= 6;
    }
}

fn crypt(password: &[u8], salt: &[u8]) -> String {
    let alternate = Md5::new()
        .chain_update(password)
        .chain_update(salt)
        .chain_update(password)
        .finalize();

    let mut ctx = Md5::new();
    ctx.update(password);
    ctx.update(PREFIX.as_bytes());
    ctx.update(salt);
    for chunk in password.chunks(16) {
        ctx.update(&alternate[..chunk.len()]);
    }
    let mut bits = password.len();
    while bits > 0 {
        if bits & 1 == 1 {
            ctx.update([0u8]);
        } else {
            ctx.update(&password[..1]);
        }
        bits >>= 1;
    }
    let mut digest = ctx.finalize();

    for round in 0..ROUNDS {
        let mut ctx = Md5::new();
        if round % 2 == 1 {
            ctx.update(password);
        } else {
            ctx.update(digest);
        }
        if round % 3 != 0 {
            ctx.update(salt);
        }
        if round % 7 != 0 {
            ctx.update(password);
        }
        if round % 2 == 1 {
            ctx.update(digest);
        } else {
            ctx.update(password);
        }
        digest = ctx.finalize();
    }

    let mut out = String::with_capacity(PREFIX.len() + salt.len() + 23);
    out.push_str(PREFIX);
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');
    for (a, b, c) in GROUPS {
        let value = (u32::from(digest[a]) << 16) | (u32::from(digest[b]) << 8) | u32::from(digest[c]);
        push_b64(&mut out, value, 4);
    }
    push_b64(&mut out, u32::from(digest[11]), 2);
    out
}

/// Checks `password` against a stored `$apr1$salt$digest` value.
pub(crate) fn verify(password: &str, stored: &str) -> bool {
    let Some(rest) = stored.strip_prefix(PREFIX) else {
        return false;
    };
    let Some((salt, _)) = rest.split_once('$') else {
        return false;
    };
    let salt = &salt.as_bytes()[..salt.len().min(MAX_SALT_LEN)];
    crypt(password.as_bytes(), salt) == stored
}
