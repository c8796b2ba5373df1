use sbq_courier::{run_cli, CliError};
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        match e {
            // No subscriber is installed, so the log line would be lost
            CliError::Logging { .. } => eprintln!("{}", e),
            _ => error!("{}", e),
        }

        std::process::exit(1);
    }
}
