mod account;
mod bootstrap;
mod cli;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let boot = bootstrap::bootstrap_from_env().await?;
    let app = http::app(boot.dispatcher);

    let listener = tokio::net::TcpListener::bind(&boot.bind).await?;
    tracing::info!(bind = %boot.bind, "router-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
