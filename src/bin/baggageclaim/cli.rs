use baggageclaim::DriverKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "baggageclaim")]
#[command(version, about = "Manage ephemeral copy-on-write volumes", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Keep timers and the reaper running
    baggageclaim --volumes /srv/volumes serve --reap-interval 10

    # Create a cache volume and a copy-on-write child of it
    baggageclaim create --handle cache --ttl 300 -p kind=cache
    baggageclaim create --cow cache --ttl 60
    baggageclaim create --strategy '{\"type\":\"import\",\"path\":\"/srv/rootfs\"}'

    # Find volumes by property
    baggageclaim list -p kind=cache

One-shot commands recover and operate on the volumes directory directly.
Do not run them against a directory a server is using.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Volumes directory
    #[arg(
        long,
        value_name = "PATH",
        global = true,
        default_value = "/var/lib/baggageclaim/volumes"
    )]
    pub volumes: PathBuf,

    /// Storage driver (naive, btrfs, overlay)
    #[arg(short, long, value_name = "DRIVER", global = true, default_value = "naive")]
    pub driver: DriverKind,

    /// Overlay layers directory
    #[arg(
        long,
        value_name = "PATH",
        global = true,
        default_value = "/var/lib/baggageclaim/overlays"
    )]
    pub overlays: PathBuf,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine until interrupted
    Serve {
        /// Seconds between reaper sweeps
        #[arg(long, value_name = "SECONDS", default_value_t = 10)]
        reap_interval: u64,
    },

    /// Create a volume
    Create {
        /// Volume handle (random if omitted)
        #[arg(long)]
        handle: Option<String>,

        /// Copy-on-write child of this volume
        #[arg(long, value_name = "PARENT", conflicts_with_all = ["import", "strategy"])]
        cow: Option<String>,

        /// Import a host directory
        #[arg(long, value_name = "PATH", conflicts_with = "strategy")]
        import: Option<PathBuf>,

        /// Strategy as JSON, e.g. {"type":"cow","volume":"cache"}
        #[arg(long, value_name = "JSON")]
        strategy: Option<String>,

        /// Property as NAME=VALUE (repeatable)
        #[arg(
            short = 'p',
            long = "property",
            value_name = "NAME=VALUE",
            value_parser = parse_property
        )]
        properties: Vec<(String, String)>,

        /// Time to live in seconds; 0 never expires
        #[arg(long, default_value_t = 0)]
        ttl: u64,

        /// Skip ownership remapping
        #[arg(long)]
        privileged: bool,
    },

    /// List volumes, optionally filtered by properties
    List {
        /// Property as NAME=VALUE (repeatable)
        #[arg(
            short = 'p',
            long = "property",
            value_name = "NAME=VALUE",
            value_parser = parse_property
        )]
        properties: Vec<(String, String)>,
    },

    /// Show a volume
    Get { handle: String },

    /// Show the parent of a copy-on-write volume
    Parent { handle: String },

    /// Show disk usage of a volume
    Stats { handle: String },

    /// Destroy a volume
    Destroy { handle: String },

    /// Set a volume property
    SetProperty {
        handle: String,
        name: String,
        value: String,
    },

    /// Restart a volume's countdown with a new TTL
    SetTtl {
        handle: String,
        /// Seconds; 0 never expires
        ttl: u64,
    },

    /// Destroy expired volumes now
    Reap,

    /// Check driver requirements
    Check,
}

/// Parse `NAME=VALUE`
pub fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {:?}", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn property_parsing() {
        assert_eq!(
            parse_property("k=v").unwrap(),
            ("k".to_string(), "v".to_string())
        );
        assert_eq!(
            parse_property("k=a=b").unwrap(),
            ("k".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_property("k=").unwrap(), ("k".to_string(), String::new()));
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=v").is_err());
    }

    #[test]
    fn create_arguments() {
        let cli = Cli::try_parse_from([
            "baggageclaim",
            "--driver",
            "overlay",
            "create",
            "--cow",
            "parent",
            "-p",
            "kind=cache",
            "--ttl",
            "60",
        ])
        .unwrap();

        assert_eq!(cli.driver, DriverKind::Overlay);
        match cli.command {
            Commands::Create {
                cow,
                properties,
                ttl,
                privileged,
                ..
            } => {
                assert_eq!(cow.as_deref(), Some("parent"));
                assert_eq!(properties, vec![("kind".to_string(), "cache".to_string())]);
                assert_eq!(ttl, 60);
                assert!(!privileged);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn conflicting_strategies_are_rejected() {
        let result = Cli::try_parse_from([
            "baggageclaim",
            "create",
            "--cow",
            "a",
            "--import",
            "/tmp",
        ]);
        assert!(result.is_err());
        assert!(Cli::try_parse_from(["baggageclaim", "--driver", "zfs", "list"]).is_err());
    }
}
