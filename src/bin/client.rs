use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sharedindex::client::{self, ClientArgs, USAGE};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharedindex=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match ClientArgs::parse(&raw) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };
    if args.help {
        println!("{}", USAGE);
        return;
    }
    if let Err(e) = client::run(args).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
