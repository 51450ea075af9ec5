use std::fs::read_to_string;
use std::process;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trellis_server::args_parse::Args;
use trellis_server::service_configuration::{LoadConfiguration, ServiceConfiguration};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line arguments
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            Args::show_usage();
            process::exit(1);
        }
    };

    // Load the configuration from the YAML file, if any
    let load_config = match &args.config_file {
        Some(path) => {
            let content = read_to_string(path)
                .with_context(|| format!("Failed to read configuration file {}", path))?;
            info!(file = %path, "loaded configuration file");
            LoadConfiguration::from_yaml(&content)?
        }
        None => LoadConfiguration::default(),
    };

    let service_config = ServiceConfiguration::try_from((args, load_config))?;
    trellis_server::run(service_config).await
}
