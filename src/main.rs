use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sharedindex::{config::Config, server};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharedindex=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env();
    if let Err(e) = server::serve(config).await {
        tracing::error!("server failed: {}", e);
        std::process::exit(1);
    }
}
