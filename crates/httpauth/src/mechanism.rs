use serde::Deserialize;
use snafu::Snafu;
use std::str::FromStr;

/// Returned when a mechanism name is neither `basic` nor `digest`.
#[derive(Debug, Snafu)]
#[snafu(display("Unknown authentication mechanism '{name}'"))]
pub struct UnknownMechanism {
    name: String,
}

/// HTTP authentication mechanism, which also selects the credential file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    /// `htpasswd` files: `user:crypt-hash`, realm not stored.
    Basic,
    /// `htdigest` files: `user:realm:md5-hex`.
    Digest,
}

impl Mechanism {
    /// Number of `:`-separated fields in a line of this format.
    pub(crate) fn field_count(self) -> usize {
        match self {
            Mechanism::Basic => 2,
            Mechanism::Digest => 3,
        }
    }
}

impl FromStr for Mechanism {
    type Err = UnknownMechanism;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "basic" | "htpasswd" => Ok(Mechanism::Basic),
            "digest" | "htdigest" => Ok(Mechanism::Digest),
            _ => UnknownMechanismSnafu { name: s }.fail(),
        }
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Basic => write!(f, "basic"),
            Mechanism::Digest => write!(f, "digest"),
        }
    }
}
