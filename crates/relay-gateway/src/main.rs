mod app;
mod bootstrap;
mod ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            format!("relay_gateway={level},tower_http=info").into()
        }))
        .init();

    bootstrap::run().await
}
