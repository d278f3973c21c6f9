use clap::Parser;
use httpauth::{CredentialStore, DesiredState, Ensure, Manifest, Mechanism, Outcome, Provider};
use nix::unistd::{Gid, Group, Uid, User};
use snafu::{OptionExt, ResultExt};
use std::io::{self, Read};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Keep HTTP Basic and Digest credential files in a declared state.
#[derive(Parser)]
#[command(name = "httpauth")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Where the credential lives.
#[derive(clap::Args)]
struct Location {
    /// Path to the credential file
    file: PathBuf,
    /// User name
    user: String,
    /// Authentication mechanism (basic, digest)
    #[arg(long, default_value = "basic")]
    mechanism: Mechanism,
    /// Realm; only stored in digest files
    #[arg(long, default_value = "")]
    realm: String,
}

/// Password and file policy of the credential.
#[derive(clap::Args)]
struct Target {
    #[command(flatten)]
    location: Location,
    /// File mode in octal
    #[arg(long, default_value = "0644")]
    mode: String,
    /// Owning user [default: current user]
    #[arg(long)]
    owner: Option<String>,
    /// Owning group [default: current primary group]
    #[arg(long)]
    group: Option<String>,
    /// Read password from stdin instead of prompting
    #[arg(long)]
    password_stdin: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Exit successfully if the file already holds the credential
    Check(Target),

    /// Write the credential unless the file already holds it
    Ensure(Target),

    /// Remove the credential from the file
    Remove(Location),

    /// List the users in a credential file
    List {
        /// Path to the credential file
        file: PathBuf,
        /// Authentication mechanism (basic, digest)
        #[arg(long, default_value = "basic")]
        mechanism: Mechanism,
    },

    /// Apply every credential declared in a TOML manifest
    Apply {
        /// Path to the manifest
        manifest: PathBuf,
    },
}

type Result<T> = ::std::result::Result<T, snafu::Whatever>;

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(io::stderr)
        .init();
}

fn read_password_from_stdin() -> Result<Zeroizing<String>> {
    let mut password = Zeroizing::new(String::new());
    io::stdin()
        .read_to_string(&mut password)
        .whatever_context("Can't read password from stdin")?;
    Ok(Zeroizing::new(password.trim_end_matches(['\r', '\n']).to_string()))
}

fn prompt_password() -> Result<Zeroizing<String>> {
    rpassword::prompt_password("Password: ")
        .whatever_context("Can't prompt for password")
        .map(Zeroizing::new)
}

fn current_owner() -> Result<String> {
    let user = User::from_uid(Uid::effective())
        .whatever_context("Can't look up current user")?
        .whatever_context("Current user has no name")?;
    Ok(user.name)
}

fn current_group() -> Result<String> {
    let group = Group::from_gid(Gid::effective())
        .whatever_context("Can't look up current group")?
        .whatever_context("Current group has no name")?;
    Ok(group.name)
}

impl Target {
    fn into_desired(self) -> Result<DesiredState> {
        let password = if self.password_stdin {
            read_password_from_stdin()?
        } else {
            prompt_password()?
        };
        let owner = match self.owner {
            Some(owner) => owner,
            None => current_owner()?,
        };
        let group = match self.group {
            Some(group) => group,
            None => current_group()?,
        };
        Ok(DesiredState {
            file: self.location.file,
            mechanism: self.location.mechanism,
            realm: self.location.realm,
            user: self.location.user,
            password: password.to_string(),
            mode: self.mode,
            owner,
            group,
        })
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Check(target) => {
            let provider = Provider::new(target.into_desired()?);
            let satisfied = provider
                .reconcile()
                .whatever_context("Can't check credential")?;
            let user = &provider.desired().user;
            if satisfied {
                println!("{user}: satisfied");
                Ok(())
            } else {
                snafu::whatever!("{user}: not satisfied")
            }
        }

        Commands::Ensure(target) => {
            let provider = Provider::new(target.into_desired()?);
            let outcome = provider
                .sync(Ensure::Present)
                .whatever_context("Can't ensure credential")?;
            println!("{}: {}", provider.desired().user, outcome);
            Ok(())
        }

        Commands::Remove(location) => {
            // Removal never looks at the password or file policy.
            let provider = Provider::new(DesiredState {
                file: location.file,
                mechanism: location.mechanism,
                realm: location.realm,
                user: location.user,
                password: String::new(),
                mode: String::new(),
                owner: String::new(),
                group: String::new(),
            });
            let outcome = provider
                .sync(Ensure::Absent)
                .whatever_context("Can't remove credential")?;
            println!("{}: {}", provider.desired().user, outcome);
            Ok(())
        }

        Commands::List { file, mechanism } => {
            let store = CredentialStore::open(&file, mechanism)
                .whatever_context("Can't open credential file")?;
            for entry in store.entries() {
                match entry.realm {
                    Some(realm) => println!("{}:{}", entry.user, realm),
                    None => println!("{}", entry.user),
                }
            }
            Ok(())
        }

        Commands::Apply { manifest } => {
            let manifest =
                Manifest::load(&manifest).whatever_context("Can't load manifest")?;
            let outcomes = manifest
                .apply()
                .whatever_context("Can't apply manifest")?;
            let changed = outcomes
                .iter()
                .filter(|outcome| **outcome != Outcome::Unchanged)
                .count();
            tracing::info!(changed, total = outcomes.len(), "Applied manifest");
            for (resource, outcome) in manifest.credentials.iter().zip(outcomes) {
                println!(
                    "{} {}: {}",
                    resource.state.file.display(),
                    resource.state.user,
                    outcome
                );
            }
            Ok(())
        }
    }
}

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli.command)
}
