use spi_analytics::config::Config;
use spi_analytics::logging::init_tracing;
use spi_analytics::replay;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env().with_args(std::env::args());
    let _log_guard = init_tracing(&config.log_level);

    let results = match replay::run(config.input.as_deref()).await {
        Ok(results) => results,
        Err(err) => {
            tracing::error!(error = %err, "replay failed");
            std::process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&results) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode results");
            std::process::exit(1);
        }
    }
}
