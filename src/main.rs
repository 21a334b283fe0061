use clap::{Parser, Subcommand};
use netglobe::net_geo::{HopTracer, Lookup, Resolver, Scanner};
use netglobe::{
    great_circle_path, GeoCoordinate, Result, Session, SessionOptions, Settings, TopologyEvent,
    TopologyNode, TopologyRegistry,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "netglobe")]
#[command(author = "Terminal Art Generator")]
#[command(version)]
#[command(about = "Live network topology: connections, geolocation and traceroute paths", long_about = None)]
struct Cli {
    /// Settings file (default: <config dir>/netglobe/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List remote peers from the connection table
    Peers,

    /// Geolocate an IP (this host's external IP when omitted)
    Locate {
        ip: Option<String>,
    },

    /// Trace the route to an IP, printing hops as they are located
    Trace {
        ip: String,
    },

    /// Discover the topology and follow changes
    Watch {
        /// Run a single discovery pass and exit
        #[arg(long)]
        once: bool,

        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print the great-circle points between two positions
    Path {
        #[arg(allow_negative_numbers = true)]
        lat1: f64,
        #[arg(allow_negative_numbers = true)]
        lon1: f64,
        #[arg(allow_negative_numbers = true)]
        lat2: f64,
        #[arg(allow_negative_numbers = true)]
        lon2: f64,

        /// Sphere radius
        #[arg(short, long, default_value = "1.0")]
        radius: f64,

        /// Degrees per step (default: session.path_resolution)
        #[arg(short = 's', long)]
        resolution: Option<f64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("netglobe: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "netglobe=debug" } else { "netglobe=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };

    match cli.command {
        Commands::Peers => peers(&settings),
        Commands::Locate { ip } => locate(&settings, ip.as_deref()),
        Commands::Trace { ip } => trace(&settings, &ip),
        Commands::Watch { once, json, duration } => watch(&settings, once, json, duration),
        Commands::Path {
            lat1,
            lon1,
            lat2,
            lon2,
            radius,
            resolution,
        } => path(
            GeoCoordinate::new(lat1, lon1)?,
            GeoCoordinate::new(lat2, lon2)?,
            radius,
            resolution.unwrap_or(settings.session.path_resolution),
        ),
    }
}

fn peers(settings: &Settings) -> Result<()> {
    let peers = Scanner::from_settings(&settings.scanner).list_foreign_peers()?;
    for (ip, record) in &peers {
        println!("{:<40} {:<12} {} -> {}", ip, record.state, record.local, record.remote);
    }
    println!("{} peers", peers.len());
    Ok(())
}

fn locate(settings: &Settings, ip: Option<&str>) -> Result<()> {
    let resolver = Resolver::from_settings(&settings.resolver)?;
    let (ip, lookup) = match ip {
        Some(ip) => (ip.to_string(), resolver.resolve(ip)?),
        None => resolver.resolve_self()?,
    };

    match lookup {
        Lookup::Found(at) => println!("{}  {:.4}, {:.4}", ip, at.lat, at.lon),
        Lookup::NotFound => println!("{}  not found", ip),
    }
    Ok(())
}

fn trace(settings: &Settings, ip: &str) -> Result<()> {
    let resolver = Resolver::from_settings(&settings.resolver)?;
    let start = match resolver.resolve_self() {
        Ok((_, lookup)) => lookup.coordinate(),
        Err(e) => {
            tracing::warn!("starting trace without own location: {}", e);
            None
        }
    };

    let tracer = HopTracer::from_settings(&settings.tracer).with_radius(settings.session.node_radius);
    for (index, node) in tracer.trace(ip, &resolver, start)?.enumerate() {
        println!("{:>2}  {}", index + 1, describe(&node));
    }
    Ok(())
}

fn watch(settings: &Settings, once: bool, json: bool, duration: Option<u64>) -> Result<()> {
    let registry = Arc::new(TopologyRegistry::from_settings(settings)?);

    if once {
        if let Err(e) = registry.discover_self() {
            tracing::warn!("locating this host failed: {}", e);
        }
        registry.refresh_peers()?;
    } else {
        let events = registry.subscribe();
        let mut session = Session::start(registry.clone(), SessionOptions::from(&settings.session))?;
        let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));

        loop {
            let wait = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) => left,
                    None => break,
                },
                None => Duration::from_secs(3600),
            };
            match events.recv_timeout(wait) {
                Ok(TopologyEvent::Added(node)) => println!("+ {}", describe(&node)),
                Ok(TopologyEvent::Updated(node)) => println!("~ {}", describe(&node)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        session.stop();
    }

    let mut nodes = registry.snapshot();
    nodes.sort_by(|a, b| a.role.as_str().cmp(b.role.as_str()).then(a.ip.cmp(&b.ip)));
    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
    } else {
        for node in &nodes {
            println!("{}", describe(node));
        }
        println!("{} nodes", nodes.len());
    }
    Ok(())
}

fn path(from: GeoCoordinate, to: GeoCoordinate, radius: f64, resolution: f64) -> Result<()> {
    for point in great_circle_path(from.to_plane(), to.to_plane(), radius, resolution) {
        println!("{:>10.5} {:>10.5} {:>10.5}", point.x, point.y, point.z);
    }
    Ok(())
}

fn describe(node: &TopologyNode) -> String {
    format!(
        "{:<40} {:<18} {:>9.4} {:>10.4}  {}",
        node.ip,
        node.role,
        node.location.lat,
        node.location.lon,
        node.state()
    )
}
