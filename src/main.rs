//! Command-line surface for the authority.
//!
//! PEM output goes to stdout so it can be piped straight into other
//! tools; revocation lists are written as raw DER bytes. Everything
//! diagnostic goes to stderr.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use authority::{certificate_pem, crl_pem, private_key_pem, Authority, Config, Error};

#[derive(Parser)]
#[command(name = "authority", version, about = "Private x509 certificate authority")]
struct Cli {
    /// Storage backend for certificates, keys and configuration.
    #[arg(long, global = true, value_enum, default_value_t = BackendKind::Vault)]
    backend: BackendKind,

    /// Root directory of the file backend.
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// Secret store address for the vault backend.
    #[arg(long, global = true)]
    server: Option<String>,

    /// Secret store token for the vault backend.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    File,
    Vault,
}

#[derive(Subcommand)]
enum Command {
    /// Root certificate operations.
    Ca {
        #[command(subcommand)]
        action: CaAction,
    },
    /// Named certificate operations.
    Cert {
        #[command(subcommand)]
        action: CertAction,
    },
    /// Configuration operations.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum CaAction {
    /// Create the root certificate if it does not exist yet.
    Create,
    /// Print the root certificate as PEM.
    Cert,
    /// Print the root private key as PEM.
    Key,
    /// Write the root revocation list as raw DER to stdout.
    Crl,
    /// Install a previously generated root certificate and key.
    Add {
        /// PEM certificate file.
        #[arg(long)]
        cert: PathBuf,
        /// PEM private key file.
        #[arg(long)]
        key: PathBuf,
    },
}

#[derive(Subcommand)]
enum CertAction {
    /// Generate a certificate and an access token for it.
    Create {
        name: String,
        /// Signing parent; defaults to the root.
        #[arg(long, default_value = "")]
        parent: String,
        /// DNS subject alternative names.
        #[arg(long = "dns")]
        dns_names: Vec<String>,
        /// IP subject alternative names.
        #[arg(long = "ip")]
        ip_addresses: Vec<IpAddr>,
    },
    /// Print a certificate as PEM.
    Cert { name: String },
    /// Print a private key as PEM.
    Key { name: String },
    /// Add a certificate to the root's revocation list.
    Revoke { name: String },
    /// Print a certificate's own revocation list as PEM.
    Crl { name: String },
    /// Import an externally produced certificate and key.
    Add {
        name: String,
        /// PEM certificate file.
        #[arg(long)]
        cert: PathBuf,
        /// PEM private key file.
        #[arg(long)]
        key: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the stored configuration document.
    Get,
    /// Store a configuration document from a TOML file.
    Set { file: PathBuf },
    /// Set one configuration item.
    SetItem { key: String, value: String },
}

fn open_authority(cli: &Cli) -> Result<Authority> {
    match cli.backend {
        BackendKind::File => {
            let path = match &cli.path {
                Some(path) => path.clone(),
                None => {
                    let home = std::env::var("HOME").context("HOME is not set")?;
                    PathBuf::from(home).join(".authority")
                }
            };
            Ok(Authority::new_local(path)?)
        }
        BackendKind::Vault => {
            let server = cli
                .server
                .clone()
                .or_else(|| std::env::var("AUTHORITY_VAULT_SERVER").ok())
                .context("no secret store address; use --server or AUTHORITY_VAULT_SERVER")?;
            let token = cli
                .token
                .clone()
                .or_else(|| std::env::var("AUTHORITY_VAULT_TOKEN").ok())
                .context("no secret store token; use --token or AUTHORITY_VAULT_TOKEN")?;
            Ok(Authority::new_remote(&server, &token)?)
        }
    }
}

fn read_material(
    cert: &std::path::Path,
    key: &std::path::Path,
) -> Result<(openssl::x509::X509, openssl::pkey::PKey<openssl::pkey::Private>)> {
    let cert_pem =
        std::fs::read(cert).with_context(|| format!("cannot read {}", cert.display()))?;
    let key_pem = std::fs::read(key).with_context(|| format!("cannot read {}", key.display()))?;
    let certificate = openssl::x509::X509::from_pem(&cert_pem)
        .context("certificate file is not a PEM certificate")?;
    let rsa = openssl::rsa::Rsa::private_key_from_pem(&key_pem)
        .context("key file is not a PEM RSA key")?;
    let private_key = openssl::pkey::PKey::from_rsa(rsa)?;
    Ok((certificate, private_key))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("authority {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut authority = open_authority(&cli)?;

    match cli.command {
        Command::Ca { action } => match action {
            CaAction::Create => {
                authority.get_ca()?;
                eprintln!("certificate authority created");
            }
            CaAction::Cert => {
                let ca = authority.get_ca()?;
                print!("{}", certificate_pem(&ca.cert.certificate)?);
            }
            CaAction::Key => {
                let ca = authority.get_ca()?;
                print!("{}", private_key_pem(&ca.cert.private_key)?);
            }
            CaAction::Crl => {
                let ca = authority.get_ca()?;
                std::io::stdout().write_all(&ca.crl)?;
            }
            CaAction::Add { cert, key } => {
                let (certificate, private_key) = read_material(&cert, &key)?;
                authority.set_ca_certificate(&certificate, &private_key)?;
                eprintln!("root certificate stored");
            }
        },
        Command::Cert { action } => match action {
            CertAction::Create {
                name,
                parent,
                dns_names,
                ip_addresses,
            } => {
                let (cert, token) =
                    authority.generate_with_options(&name, &parent, &dns_names, &ip_addresses)?;
                print!("{}", certificate_pem(&cert.certificate)?);
                if !token.is_empty() {
                    eprintln!("access token for {}: {}", cert.common_name, token);
                }
            }
            CertAction::Cert { name } => {
                let cert = authority.get(&name)?;
                print!("{}", certificate_pem(&cert.certificate)?);
            }
            CertAction::Key { name } => {
                let cert = authority.get(&name)?;
                print!("{}", private_key_pem(&cert.private_key)?);
            }
            CertAction::Revoke { name } => {
                authority.revoke(&name)?;
                eprintln!("certificate {name} revoked");
            }
            CertAction::Crl { name } => {
                let crl = authority.get_crl(&name)?;
                print!("{}", crl_pem(&crl));
            }
            CertAction::Add { name, cert, key } => {
                let (certificate, private_key) = read_material(&cert, &key)?;
                authority.set_certificate(&name, &certificate, &private_key)?;
                eprintln!("certificate {name} stored");
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Get => {
                let config = authority.get_config()?;
                print!("{}", config.to_toml()?);
            }
            ConfigAction::Set { file } => {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("cannot read {}", file.display()))?;
                let config = Config::parse(&text)?;
                authority.set_config(&config)?;
                eprintln!("configuration stored");
            }
            ConfigAction::SetItem { key, value } => {
                if !Config::key_is_valid(&key) {
                    anyhow::bail!("{key} is not a valid configuration key");
                }
                // start from the stored document when one exists
                let mut config = match authority.get_config() {
                    Ok(config) => config,
                    Err(Error::ConfigMissing) => Config::default(),
                    Err(e) => return Err(e.into()),
                };
                config.set_item(&key, &value);
                authority.set_config(&config)?;
                eprintln!("configuration stored");
            }
        },
        Command::Version => unreachable!("handled above"),
    }

    Ok(())
}
