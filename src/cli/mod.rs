use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "testbed-vm-manager")]
#[command(about = "Ephemeral libvirt test cluster provisioner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a cluster and wait until every node is reachable over ssh
    Up {
        #[arg(short, long, default_value_t = 1)]
        masters: u32,
        #[arg(short, long, default_value_t = 2)]
        workers: u32,
        /// Starting index for node numbering
        #[arg(short, long, default_value_t = 0)]
        offset: u32,
        /// Destroy the cluster again once every node is ready
        #[arg(long)]
        teardown: bool,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Up {
            masters,
            workers,
            offset,
            teardown,
        } => {
            let settings = match &cli.config {
                Some(path) => Settings::new_from_file(path)?,
                None => Settings::new()?,
            };
            handle_up_command(&settings, masters, workers, offset, teardown).await?;
        }
        Commands::Init { force } => {
            handle_init_command(force)?;
        }
    }

    Ok(())
}

#[cfg(feature = "libvirt")]
async fn handle_up_command(
    settings: &Settings,
    masters: u32,
    workers: u32,
    offset: u32,
    teardown: bool,
) -> anyhow::Result<()> {
    use std::sync::Arc;

    use anyhow::Context;
    use tracing::info;

    use crate::core::libvirt::LibvirtFactory;
    use crate::core::pool::HardwarePool;
    use crate::core::ssh::CommandSshProbe;

    let opts = settings
        .node_options()
        .with_context(|| format!("reading {}", settings.ssh.public_key_path.display()))?;
    let factory = Arc::new(LibvirtFactory::new(settings.libvirt.connection_uri.clone()));
    let probe = Arc::new(CommandSshProbe::new(
        settings.ssh.user.clone(),
        settings.ssh.private_key_path.clone(),
    ));

    let mut pool = HardwarePool::new(factory, &settings.libvirt.network, probe, opts).await?;
    info!(run_id = %pool.run_id(), "provisioning cluster");

    let failures = pool.boot_nodes(masters, workers, offset).await;
    for node in pool.nodes() {
        println!(
            "{} {} ({}) {}",
            "✓".green(),
            node.name(),
            node.role(),
            node.ssh_ip().unwrap_or("-")
        );
    }
    for failure in &failures {
        println!("{} {}: {}", "✗".red(), failure.name, failure.error);
    }

    println!("{}", serde_json::to_string_pretty(&pool.report())?);

    if teardown {
        let destroy_failures = pool.destroy_all().await;
        for failure in &destroy_failures {
            println!("{} {}: {}", "✗".red(), failure.name, failure.error);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} of {} nodes failed to boot", failures.len(), masters + workers)
    }
}

#[cfg(not(feature = "libvirt"))]
async fn handle_up_command(
    _settings: &Settings,
    _masters: u32,
    _workers: u32,
    _offset: u32,
    _teardown: bool,
) -> anyhow::Result<()> {
    anyhow::bail!("built without the `libvirt` feature; rebuild with --features libvirt")
}

fn handle_init_command(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from("config");
    let config_file = config_dir.join("default.toml");
    if config_file.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite.",
            config_file.display()
        );
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&config_file, config_str)?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}
