use callrecctl::{init_tracing, run, Cli};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    if let Err(err) = run(cli).await {
        eprintln!("callrecctl error: {err}");
        std::process::exit(1);
    }
}
