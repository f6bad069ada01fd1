mod cli;

use vidrelay::{config, server, session::SessionManager};
use vidrelay_av::ToolRegistry;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // CLI flags win over the config file
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting vidrelay");
    tracing::info!(
        "Storage root {:?}, {} concurrent acquisitions",
        config.sessions.storage_root,
        config.sessions.max_concurrent_acquisitions
    );

    let manager = Arc::new(SessionManager::from_config(&config)?);
    server::start_server(config, manager).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vidrelay=trace,vidrelay_av=trace,vidrelay_common=debug,tower_http=debug".to_string()
        } else {
            "vidrelay=debug,vidrelay_av=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("vidrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn check_tools(config_path: Option<&std::path::Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
        Ok(())
    } else {
        anyhow::bail!("Some tools are missing. Install ffmpeg or set tools.ffmpeg_path.")
    }
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    let (config, source) = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            (config::load_config(p)?, p.display().to_string())
        }
        None => match config::find_default_config() {
            Some(p) => {
                println!("Validating config: {:?}", p);
                (config::load_config(&p)?, p.display().to_string())
            }
            None => {
                println!("No config file found, using defaults");
                (config::Config::default(), "defaults".to_string())
            }
        },
    };

    println!("✓ Configuration is valid ({})", source);
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Storage root: {}", config.sessions.storage_root.display());
    println!(
        "  Acquisitions: {} concurrent",
        config.sessions.max_concurrent_acquisitions
    );
    println!(
        "  Idle timeout: {}s, max age: {}s, sweep every {}s",
        config.sessions.idle_timeout_secs,
        config.sessions.max_session_age_secs,
        config.sessions.sweep_interval_secs
    );
    for warning in config.warnings() {
        println!("  ! {}", warning);
    }

    Ok(())
}
