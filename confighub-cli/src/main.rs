mod server;
mod sign;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::server::config::{ConfigHubConfig, StorageBackend};

#[derive(Parser, Debug)]
#[command(name = "confighub")]
#[command(version = "0.3.2")]
#[command(about = "Versioned configuration with gray releases and long-poll watches", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the configuration server
    Serve {
        /// Path to config file
        #[arg(short = 'c', long = "config", env = "CONFIGHUB_CONFIG", default_value = "confighub.toml")]
        config: String,

        /// Port to listen on
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long = "hostname")]
        hostname: Option<String>,

        /// Directory for the sled database
        #[arg(short = 'd', long = "data-dir")]
        data_dir: Option<String>,

        /// Storage backend: sled or memory
        #[arg(short = 's', long = "storage")]
        storage: Option<String>,

        /// Log filter used when RUST_LOG is unset (e.g. info, confighub=debug)
        #[arg(short = 'l', long = "log-level")]
        log_level: Option<String>,
    },
    /// Print signed request headers for an API call
    Sign {
        /// Access key id
        #[arg(short = 'k', long = "access-key", env = "CONFIGHUB_ACCESS_KEY")]
        access_key: String,

        /// Access key secret
        #[arg(long = "secret", env = "CONFIGHUB_SECRET")]
        secret: String,

        /// HTTP method
        #[arg(short = 'X', long = "method", default_value = "GET")]
        method: String,

        /// Request path including the query string (e.g. "/api/v1/config?name=db")
        path: String,

        /// Unix timestamp to sign; defaults to now
        #[arg(long = "timestamp")]
        timestamp: Option<i64>,

        /// Nonce to sign; defaults to a random-looking value
        #[arg(long = "nonce")]
        nonce: Option<String>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[tokio::main]
async fn main() {
    let cli = Args::parse();
    match cli.cmd {
        Command::Serve {
            config,
            port,
            hostname,
            data_dir,
            storage,
            log_level,
        } => {
            let mut config = ConfigHubConfig::load(&config);
            config.apply_env_overrides();

            // CLI args beat both the file and the environment.
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(hostname) = hostname {
                config.server.hostname = hostname;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            if let Some(storage) = storage {
                match StorageBackend::parse(&storage) {
                    Some(backend) => config.server.storage = backend,
                    None => config
                        .warnings
                        .push(format!("unknown --storage value: {}", storage)),
                }
            }
            if let Some(level) = log_level {
                config.log.level = level;
            }

            init_tracing(&config.log.level);
            for warning in &config.warnings {
                warn!("{}", warning);
            }
            server::run_serve(config).await
        }
        Command::Sign {
            access_key,
            secret,
            method,
            path,
            timestamp,
            nonce,
        } => sign::run_sign(&access_key, &secret, &method, &path, timestamp, nonce),
    }
}
