use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// JSON-lines replay input; stdin when absent.
    pub input: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let input = std::env::var("SPI_REPLAY_INPUT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Self { log_level, input }
    }

    /// A positional argument overrides `SPI_REPLAY_INPUT`.
    pub fn with_args<I: IntoIterator<Item = String>>(mut self, args: I) -> Self {
        if let Some(path) = args.into_iter().nth(1) {
            self.input = Some(PathBuf::from(path));
        }
        self
    }
}
