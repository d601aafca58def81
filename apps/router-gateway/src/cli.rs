use clap::Parser;

/// CLI/ENV-configurable gateway options: `#[arg(long, env = "...")]` per
/// field, CLI wins over ENV, both are optional so a config file or the
/// built-in default can still apply.
#[derive(Debug, Clone, Parser)]
#[command(name = "router-gateway", version, about = "A demonstration HTTP front end for the request router")]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "ROUTER_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "ROUTER_PORT")]
    pub port: Option<u16>,

    /// Path to the accounts file. Persisted state across restarts is not
    /// the core's concern — the gateway's own Account implementation is
    /// file-backed.
    #[arg(long, env = "ROUTER_ACCOUNTS_FILE")]
    pub accounts_file: Option<String>,

    /// Overrides `EngineConfig::max_retries`.
    #[arg(long, env = "ROUTER_MAX_RETRIES")]
    pub max_retries: Option<u32>,
}

