use baggageclaim::{
    utils, DriverKind, Engine, EngineBuilder, Properties, Repository, Strategy, StrategySpec,
    Ttl, VolumeSpec,
};
use console::style;
use log::{debug, info};
use serde::Serialize;
use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::cli::{Cli, Commands};

type CommandResult = Result<(), Box<dyn Error>>;

fn print_json<T: Serialize>(value: &T) -> CommandResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn builder(cli: &Cli) -> EngineBuilder {
    EngineBuilder::new(&cli.volumes)
        .driver(cli.driver)
        .overlays_dir(&cli.overlays)
}

/// Engine for a single command: no periodic reaper
fn open(cli: &Cli) -> Result<Engine, Box<dyn Error>> {
    let engine = builder(cli).without_reaper().start()?;
    debug!("recovery: {:?}", engine.recovery());
    Ok(engine)
}

fn strategy(
    cow: Option<String>,
    import: Option<PathBuf>,
    spec: Option<String>,
) -> Result<Strategy, Box<dyn Error>> {
    if let Some(json) = spec {
        let spec: StrategySpec = serde_json::from_str(&json)?;
        return Ok(Strategy::try_from(spec)?);
    }
    Ok(match (cow, import) {
        (Some(parent), _) => Strategy::cow(parent),
        (None, Some(path)) => Strategy::import(path),
        (None, None) => Strategy::Empty,
    })
}

pub fn execute(cli: Cli) -> CommandResult {
    match &cli.command {
        Commands::Serve { reap_interval } => serve(&cli, *reap_interval),
        Commands::Check => {
            check_requirements();
            Ok(())
        }
        Commands::Create {
            handle,
            cow,
            import,
            strategy: spec,
            properties,
            ttl,
            privileged,
        } => {
            let mut spec = VolumeSpec::new(strategy(cow.clone(), import.clone(), spec.clone())?)
                .properties(properties.iter().cloned().collect())
                .ttl(Ttl::from_secs(*ttl))
                .privileged(*privileged);
            if let Some(handle) = handle {
                spec = spec.handle(handle.clone());
            }

            let engine = open(&cli)?;
            let volume = engine.repository().create_volume(spec)?;
            print_json(&volume)
        }
        Commands::List { properties } => {
            let query: Properties = properties.iter().cloned().collect();
            let engine = open(&cli)?;
            print_json(&engine.repository().list_volumes(&query)?)
        }
        Commands::Get { handle } => {
            let engine = open(&cli)?;
            match engine.repository().get_volume(handle)? {
                Some(volume) => print_json(&volume),
                None => Err(format!("volume not found: {}", handle).into()),
            }
        }
        Commands::Parent { handle } => {
            let engine = open(&cli)?;
            print_json(&engine.repository().volume_parent(handle)?)
        }
        Commands::Stats { handle } => {
            let engine = open(&cli)?;
            print_json(&engine.repository().volume_stats(handle)?)
        }
        Commands::Destroy { handle } => {
            let engine = open(&cli)?;
            engine.repository().destroy_volume(handle)?;
            info!("destroyed {}", handle);
            Ok(())
        }
        Commands::SetProperty {
            handle,
            name,
            value,
        } => {
            let engine = open(&cli)?;
            engine.repository().set_property(handle, name, value)?;
            Ok(())
        }
        Commands::SetTtl { handle, ttl } => {
            let engine = open(&cli)?;
            engine.repository().set_ttl(handle, Ttl::from_secs(*ttl))?;
            Ok(())
        }
        Commands::Reap => {
            let engine = open(&cli)?;
            let reaped = engine.reap()?;
            println!("reaped {} volume(s)", reaped);
            Ok(())
        }
    }
}

fn serve(cli: &Cli, reap_interval: u64) -> CommandResult {
    let engine = builder(cli)
        .reap_interval(Duration::from_secs(reap_interval))
        .start()?;

    let recovery = engine.recovery();
    println!(
        "{} {} volumes on {} ({} driver)",
        style("serving").green().bold(),
        recovery.live_volumes,
        cli.volumes.display(),
        cli.driver
    );
    if recovery.finished_teardowns + recovery.discarded_orphans > 0 {
        println!(
            "  finished {} teardown(s), discarded {} unfinished volume(s)",
            recovery.finished_teardowns, recovery.discarded_orphans
        );
    }

    // Timers and the reaper run on their own threads.
    loop {
        thread::park();
    }
}

pub fn check_requirements() {
    info!("Checking driver requirements");
    println!("Checking driver requirements...\n");

    let root = utils::is_root();
    if root {
        println!("[✓] Running as root");
    } else {
        println!("[✗] NOT running as root (btrfs and overlay need it)");
    }

    println!("\nDrivers:");
    for driver in DriverKind::all() {
        let usable = root || !driver.requires_root();
        println!(
            "  {:8} {}",
            driver.to_string(),
            if usable { "[✓] usable" } else { "[✗] needs root" }
        );
    }
}
