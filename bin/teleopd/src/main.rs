//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the teleoperation daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use teleop_common::{init_tracing, new_registry, LogFormat, SceneConfig};
use teleop_msg::SCHEMA_VERSION;
use teleop_net::TeleopServerBuilder;
use teleop_sim::KinematicArm;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_SCENE: &str = "configs/scene.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "Teleoperation simulation server", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to the scene configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the console log format")]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve operator connections")]
    Run,
    #[command(about = "Validate the scene configuration and print a summary")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_SCENE));

    let loaded = SceneConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("teleopd", &config.logging)?;
            run_daemon(config, &loaded.source).await
        }
        Commands::CheckConfig => check_config(&config, &loaded.source),
    }
}

async fn run_daemon(config: SceneConfig, source: &Path) -> Result<()> {
    if config.schema_version != SCHEMA_VERSION {
        warn!(
            scene_schema = %config.schema_version,
            protocol_schema = SCHEMA_VERSION,
            "scene schema version differs from the wire protocol"
        );
    }
    info!(
        scene_id = %config.scene_id,
        source = %source.display(),
        joints = config.joint_count(),
        objects = config.objects.len(),
        "scene configuration loaded"
    );

    let scene = Arc::new(config);
    let engine = KinematicArm::from_config(&scene);
    let handle = TeleopServerBuilder::new(scene, engine)
        .with_registry(new_registry())
        .spawn()
        .await?;
    info!(address = %handle.local_addr(), "daemon running; waiting for termination signal");

    tokio::select! {
        received = signal::ctrl_c() => {
            received?;
            info!("ctrl-c received; shutting down");
            handle.shutdown().await
        }
        fault = handle.wait_for_fault() => {
            let reason = fault.unwrap_or_else(|| "server stopped unexpectedly".to_owned());
            error!(reason = %reason, "terminating after physics fault");
            handle.shutdown().await?;
            bail!("physics engine fault: {reason}")
        }
    }
}

fn check_config(config: &SceneConfig, source: &Path) -> Result<()> {
    let listen = config.networking.listen_addr()?;
    println!("Scene:      {} ({})", config.scene_id, source.display());
    println!("Endpoint:   ws://{}{}", listen, config.networking.ws_path);
    println!("Joints:     {}", config.joint_count());
    println!("Objects:    {}", config.objects.len());
    println!(
        "Rates:      control {} Hz, state {} Hz",
        config.rates.control_hz, config.rates.state_hz
    );
    if config.schema_version != SCHEMA_VERSION {
        println!(
            "Warning:    scene schema {} differs from protocol schema {}",
            config.schema_version, SCHEMA_VERSION
        );
    }
    Ok(())
}
