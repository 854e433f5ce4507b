use clap::Parser;
use convoy::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("convoy=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli::execute(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            std::process::exit(1);
        }
    }
}
