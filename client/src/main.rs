//! redoubt-harvest
//!
//! Describes this machine to a redoubt server, negotiates, and installs the
//! products it hands out.

use anyhow::Context;
use clap::Parser;
use redoubt_client::session::DEFAULT_MAX_ROUNDS;
use redoubt_client::{persist, HttpTransport, Session};
use shared::MachineInfo;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "redoubt-harvest", version, about = "Fetch products from a redoubt server")]
struct Args {
    /// Server address, `host:port` or a base URL
    #[arg(long, env = "REDOUBT_SERVER", default_value = "127.0.0.1:2326")]
    server: String,

    /// Directory products are written under
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Give up after this many rounds
    #[arg(long, default_value_t = DEFAULT_MAX_ROUNDS)]
    max_rounds: usize,

    /// Comma separated list of host IPs
    #[arg(long, value_delimiter = ',')]
    ips: Vec<String>,

    /// Machine's FQDN
    #[arg(long)]
    fqdn: String,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    domain: Option<String>,

    /// Cluster the machine belongs to
    #[arg(long)]
    cluster: Option<String>,

    #[arg(long)]
    node_type: Option<String>,

    /// Machine ID, usually a sequence number or hash
    #[arg(long)]
    id: Option<String>,

    /// Cloud provider
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    city: Option<String>,

    #[arg(long)]
    country: Option<String>,

    /// Free form geographical info
    #[arg(long)]
    geo: Option<String>,

    /// Extra `key=value` pairs for the server, comma separated
    #[arg(long, value_delimiter = ',', value_parser = parse_key_value)]
    extra: Vec<(String, String)>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

impl Args {
    fn machine(&self) -> MachineInfo {
        MachineInfo {
            ips: self.ips.iter().filter(|ip| !ip.is_empty()).cloned().collect(),
            fqdn: self.fqdn.clone(),
            host: self.host.clone(),
            domain: self.domain.clone(),
            cluster: self.cluster.clone(),
            node_type: self.node_type.clone(),
            id: self.id.clone(),
            provider: self.provider.clone(),
            region: self.region.clone(),
            city: self.city.clone(),
            country: self.country.clone(),
            geo: self.geo.clone(),
            extra: self.extra.iter().cloned().collect::<BTreeMap<_, _>>(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let machine = args.machine();
    info!(fqdn = %machine.fqdn, ips = ?machine.ips, "Harvesting");

    let transport = HttpTransport::new(&args.server)?;
    let products = Session::new(transport, machine)
        .with_max_rounds(args.max_rounds)
        .harvest()
        .await
        .context("harvest failed")?;

    let written = persist::write_all(&args.dir, &products)
        .with_context(|| format!("writing products under {}", args.dir.display()))?;
    info!(products = written.len(), dir = %args.dir.display(), "Products installed");
    Ok(())
}
