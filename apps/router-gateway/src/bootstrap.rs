use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use router_common::EngineConfig;
use router_engine::Dispatcher;
use router_providers::{ReplicateProvider, VertexProvider};

use crate::account::FileAccount;
use crate::cli::CliArgs;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ACCOUNTS_FILE: &str = "accounts.json";

pub struct Bootstrap {
    pub dispatcher: Arc<Dispatcher>,
    pub bind: String,
}

/// CLI > ENV > built-in default (clap already resolves CLI-over-ENV per
/// field via `env = "..."`; only the final fallback-to-default layer is
/// done here).
pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    bootstrap(CliArgs::parse()).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    init_tracing();

    let host = args.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.unwrap_or(DEFAULT_PORT);
    let accounts_path = args
        .accounts_file
        .unwrap_or_else(|| DEFAULT_ACCOUNTS_FILE.to_string());

    let account = Arc::new(FileAccount::load(&accounts_path).context("load accounts file")?);

    let mut engine_config = EngineConfig::default();
    if let Some(max_retries) = args.max_retries {
        engine_config.max_retries = max_retries;
    }

    let dispatcher = Arc::new(Dispatcher::new(account.clone(), engine_config));
    register_configured_providers(&dispatcher, account.as_ref()).await?;

    Ok(Bootstrap {
        dispatcher,
        bind: format!("{host}:{port}"),
    })
}

/// Registers the bundled example providers (Replicate and Vertex) for
/// whichever of them appear in the accounts file — an unconfigured
/// provider is simply never registered, so a
/// request naming it fails with `ConfigurationError` at
/// `prepare_provider`, not at startup.
async fn register_configured_providers(
    dispatcher: &Dispatcher,
    account: &FileAccount,
) -> anyhow::Result<()> {
    use router_provider::Account as _;
    for name in account.configured_providers().await {
        match name.as_str() {
            "replicate" => {
                dispatcher
                    .register_provider(Arc::new(ReplicateProvider::new()))
                    .await
                    .context("register replicate provider")?;
            }
            "vertex" => {
                let cfg = account
                    .config_for_provider(&name)
                    .await
                    .context("load vertex provider config")?;
                let custom = cfg.custom_provider_config.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("vertex provider requires custom_provider_config {{project, location}}")
                })?;
                let (project, location) = parse_vertex_custom_config(&custom.upstream_proto)?;
                dispatcher
                    .register_provider(Arc::new(VertexProvider::new(project, location)))
                    .await
                    .context("register vertex provider")?;
            }
            other => {
                tracing::warn!(provider = other, "accounts file configures an unknown provider, skipping");
            }
        }
    }
    Ok(())
}

/// Vertex needs a `{project}/{location}` pair that has no natural home
/// on the shared `ProviderConfig`; it is smuggled through
/// `custom_provider_config.upstream_proto` as `"project/location"` since
/// that field otherwise only makes sense for genuinely custom vendors.
fn parse_vertex_custom_config(upstream_proto: &str) -> anyhow::Result<(String, String)> {
    let (project, location) = upstream_proto
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("vertex upstream_proto must be \"project/location\", got {upstream_proto:?}"))?;
    Ok((project.to_string(), location.to_string()))
}

/// `tracing-subscriber` with an `EnvFilter` (`RUST_LOG`).
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
