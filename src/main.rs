//! Binary entrypoint for the nodelink CLI.
//!
//! Commands:
//! - `init` - write a starter `nodelink.toml`
//! - `replay --file <capture> [--device <id>] [--export <path>] [--history <path>]` - run a
//!   recorded notification capture through a full session and print the
//!   resulting state as JSON
//! - `show-config` - print the effective configuration
//!
//! See the library crate docs for module-level details: `nodelink::`.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::time::Duration;

use nodelink::config::Config;
use nodelink::replay::{parse_capture, run_replay};

#[derive(Parser)]
#[command(name = "nodelink")]
#[command(about = "Session engine for sensor nodes on small-MTU notification links")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "nodelink.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Replay a notification capture through a session
    Replay {
        /// Capture file, one notification per line
        #[arg(short, long)]
        file: String,
        /// Device id reported in the output
        #[arg(short, long, default_value = "replay")]
        device: String,
        /// Write the last export CSV here
        #[arg(short, long)]
        export: Option<String>,
        /// Write streamed history samples here as CSV
        #[arg(long)]
        history: Option<String>,
        /// Seconds to wait for transfers and history drains to finish
        #[arg(short, long, default_value_t = 60)]
        timeout: u64,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Writing default configuration to {}", cli.config);
            Config::create_default(&cli.config).await?;
            println!("Created {}", cli.config);
        }
        Commands::Replay {
            file,
            device,
            export,
            history,
            timeout,
        } => {
            let config = match pre_config {
                Some(config) => config,
                None => {
                    warn!("No usable config at {}; using defaults", cli.config);
                    Config::default()
                }
            };
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read capture {}", file))?;
            let notifications = parse_capture(&text)?;
            info!("Replaying {} notifications from {}", notifications.len(), file);

            let report = run_replay(
                &device,
                config.session_settings(),
                notifications,
                Duration::from_secs(timeout),
            )
            .await?;

            if let Some(path) = export {
                match report.exports.last() {
                    Some(csv) => {
                        tokio::fs::write(&path, csv)
                            .await
                            .with_context(|| format!("Failed to write export {}", path))?;
                        info!("Wrote export to {}", path);
                    }
                    None => warn!("Capture produced no export; {} not written", path),
                }
            }
            if let Some(path) = history {
                match &report.history_csv {
                    Some(csv) => {
                        tokio::fs::write(&path, csv)
                            .await
                            .with_context(|| format!("Failed to write history {}", path))?;
                        info!("Wrote history to {}", path);
                    }
                    None => warn!("Capture streamed no history; {} not written", path),
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::ShowConfig => {
            let config = pre_config.unwrap_or_default();
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    let opened = log_file.and_then(|file| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .ok()
    });
    match opened {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Only echo to the console when someone is watching it
            let is_tty = atty::is(atty::Stream::Stderr);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
