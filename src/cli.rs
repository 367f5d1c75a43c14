use crate::core::config::Config;
use crate::core::daemon::Daemon;
use crate::ecies;
use crate::key::group::{self, Group};
use crate::key::keys::{Identity, Pair};
use crate::key::store::FileStore;
use crate::key::toml::{FromToml, IntoToml};
use crate::net::protocol::{self, ProtocolClient};
use crate::net::utils::{Address, ClientTls, NodeListener, Seconds};

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use energon::drand::schemes::DefaultScheme;
use std::path::PathBuf;

/// Generate the long-term keypair (quorand_id.private, quorand_id.public)
/// for this node.
#[derive(Debug, Parser)]
pub struct KeyGenConfig {
    /// Folder to keep all quorand cryptographic information, with absolute path.
    #[arg(long, default_value_os_t = FileStore::quorand_home())]
    pub folder: PathBuf,
    /// Mark the identity as reachable over TLS.
    #[arg(long)]
    pub tls: bool,
    /// The address other nodes will be able to contact this node on.
    pub address: String,
}

/// Create the group descriptor from individual public identity files.
#[derive(Debug, Parser)]
pub struct GroupConfig {
    /// Signing threshold to apply for the group. Default is n/2 + 1.
    #[arg(long, short)]
    pub threshold: Option<u32>,
    /// Where to save the group file.
    #[arg(long, short, default_value = "group.toml")]
    pub out: PathBuf,
    /// Public identity files of every group member, in group order.
    #[arg(required = true)]
    pub identities: Vec<PathBuf>,
}

/// Run the daemon: first do the DKG if needed, then run the beacon.
#[derive(Debug, Parser)]
pub struct RunConfig {
    /// Folder to keep all quorand cryptographic information, with absolute path.
    #[arg(long, default_value_os_t = FileStore::quorand_home())]
    pub folder: PathBuf,
    /// Group file listing all participants. Only needed if the DKG has not
    /// been run yet.
    #[arg(long)]
    pub group: Option<PathBuf>,
    /// Leader is the first node to start the DKG protocol.
    #[arg(long)]
    pub leader: bool,
    /// Runs the beacon every PERIOD, e.g. 30s.
    #[arg(long, default_value = "60s")]
    pub period: Seconds,
    /// Total time budget of the DKG protocol.
    #[arg(long, default_value = "60s")]
    pub dkg_timeout: Seconds,
    /// Listening (binding) address. Useful if you have some kind of proxy.
    #[arg(long)]
    pub listen: Option<String>,
    /// TLS certificate path to use by the server.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,
    /// TLS private key to use by the server.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,
    /// Directory containing trusted certificates. Useful for testing and
    /// self signed certificates.
    #[arg(long)]
    pub certs_dir: Option<PathBuf>,
    /// Indicates to use a non TLS server and connections.
    #[arg(long)]
    pub insecure: bool,
}

#[derive(Debug, Parser)]
pub enum Fetch {
    /// Fetch a public verifiable and unbiasable randomness value.
    Public {
        /// Address of the node to contact.
        address: String,
        /// Contact the node over TLS.
        #[arg(long)]
        tls: bool,
        /// Directory containing trusted certificates.
        #[arg(long)]
        certs_dir: Option<PathBuf>,
    },
    /// Fetch a private randomness value. Request and response are encrypted.
    Private {
        /// Public identity file of the remote node.
        identity: PathBuf,
        /// Directory containing trusted certificates.
        #[arg(long)]
        certs_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Parser)]
#[command(name = "quorand")]
#[command(about = "Distributed randomness beacon", long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    commands: Cmd,
}

#[derive(Debug, Parser)]
pub enum Cmd {
    GenerateKeypair(KeyGenConfig),
    Group(GroupConfig),
    Run(RunConfig),
    #[command(subcommand)]
    Fetch(Fetch),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Logs are disabled in tests by default.
        #[cfg(not(test))]
        crate::log::init_tracing(self.verbose)?;

        match self.commands {
            Cmd::GenerateKeypair(config) => keygen_cmd(&config)?,
            Cmd::Group(config) => group_cmd(&config)?,
            Cmd::Run(config) => run_cmd(config).await?,
            Cmd::Fetch(Fetch::Public {
                address,
                tls,
                certs_dir,
            }) => fetch_public_cmd(&address, tls, certs_dir).await?,
            Cmd::Fetch(Fetch::Private {
                identity,
                certs_dir,
            }) => fetch_private_cmd(&identity, certs_dir).await?,
        }

        Ok(())
    }
}

fn keygen_cmd(config: &KeyGenConfig) -> Result<()> {
    println!("Generating private / public key pair");
    let address = Address::precheck(&config.address)?;
    let pair = Pair::<DefaultScheme>::generate(address, config.tls);

    let fs = FileStore::set(&config.folder);
    fs.save_key_pair(&pair)?;

    println!(
        "Generated keys at {}\n{}",
        fs.public_key_file().display(),
        pair.public_identity()
    );

    Ok(())
}

fn group_cmd(config: &GroupConfig) -> Result<()> {
    let mut identities = Vec::with_capacity(config.identities.len());
    for path in &config.identities {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity {}", path.display()))?;
        identities.push(Identity::<DefaultScheme>::from_toml(&body)?);
    }

    let threshold = match config.threshold {
        Some(threshold) => {
            let minimum = group::default_threshold(identities.len());
            if threshold < minimum {
                println!("WARNING: threshold {threshold} is below the recommended {minimum}");
            }
            threshold
        }
        None => group::default_threshold(identities.len()),
    };

    let group = Group::from_identities(identities, threshold)?;
    std::fs::write(&config.out, group.to_toml()?)?;
    println!(
        "Group file with threshold {threshold} written to {}",
        config.out.display()
    );

    Ok(())
}

async fn run_cmd(rc: RunConfig) -> Result<()> {
    let fs = FileStore::set(&rc.folder);
    let keypair = fs.load_key_pair::<DefaultScheme>()?;

    let config = Config::new(rc.folder.clone(), rc.period, rc.dkg_timeout)
        .with_tls(rc.tls_cert.clone(), rc.tls_key.clone())
        .with_certs_dir(rc.certs_dir.clone())
        .with_insecure(rc.insecure);
    config.check()?;

    let has_distributed = fs.has_distributed();
    let group = if has_distributed {
        fs.load_group::<DefaultScheme>()?
    } else {
        let path = rc
            .group
            .as_ref()
            .ok_or_else(|| anyhow!("the DKG has not been run yet: --group file is required"))?;
        Group::<DefaultScheme>::from_toml(&std::fs::read_to_string(path)?)?
    };
    if group.find_index(keypair.public_identity()).is_none() {
        bail!("our identity is not part of the group descriptor");
    }

    // Listening address defaults to the identity address.
    let listen = match &rc.listen {
        Some(listen) => Address::precheck(listen)?,
        None => keypair.public_identity().address().clone(),
    };

    let daemon = Daemon::new(keypair, group, config, fs)?;
    let server = tokio::spawn(protocol::start_server::<DefaultScheme, NodeListener>(
        daemon.clone(),
        listen,
    ));

    if has_distributed {
        daemon.load().await?;
    } else if rc.leader {
        daemon.start_dkg().await?;
    }
    // A follower without distributed material waits for the leader's first
    // DKG packet to arrive over the transport.

    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            daemon.stop().await;
            false
        }
        // The token is cancelled by the daemon itself only on fatal errors
        // (DKG failure or timeout, beacon store failure).
        () = daemon.token.cancelled() => true,
    };
    let _ = server.await?;

    if fatal {
        bail!("node terminated due to a fatal error, check the logs");
    }

    Ok(())
}

async fn fetch_public_cmd(address: &str, tls: bool, certs_dir: Option<PathBuf>) -> Result<()> {
    let address = Address::precheck(address)?;
    let tls_config = tls.then(|| ClientTls { certs_dir });

    let mut client = ProtocolClient::connect(&address, tls_config.as_ref()).await?;
    let response = client.public().await?;

    println!("round: {}", response.round);
    println!("previous: {}", hex::encode(&response.previous));
    println!("randomness: {}", hex::encode(&response.randomness));

    Ok(())
}

async fn fetch_private_cmd(identity: &PathBuf, certs_dir: Option<PathBuf>) -> Result<()> {
    let body = std::fs::read_to_string(identity)
        .with_context(|| format!("reading identity {}", identity.display()))?;
    let value: toml::Value = toml::from_str(&body)?;

    let address = value
        .get("Address")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("identity file: expected Address"))?;
    let tls = value
        .get("TLS")
        .and_then(|v| v.as_bool())
        .unwrap_or_default();
    let server_key: [u8; ecies::KEY_SIZE] = hex::decode(
        value
            .get("EncryptionKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("identity file: expected EncryptionKey"))?,
    )?
    .as_slice()
    .try_into()
    .map_err(|_| anyhow!("identity file: malformed EncryptionKey"))?;

    let address = Address::precheck(address)?;
    let tls_config = tls.then(|| ClientTls { certs_dir });
    let mut client = ProtocolClient::connect(&address, tls_config.as_ref()).await?;

    let (ephemeral, request) = ecies::new_request(&server_key)?;
    let response = client.private_rand(request).await?;
    let randomness = ecies::open_response(&ephemeral, &response)?;

    println!("randomness: {}", hex::encode(randomness));

    Ok(())
}
