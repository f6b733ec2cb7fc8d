use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Path of the embedded store's database file.
    pub database_path: String,
    /// Seconds between cache refresh cycles.
    pub refresh_interval_secs: u64,
    /// Path of the JSON file keyring, when no platform keyring is in use.
    pub keyring_file: Option<String>,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    Ok(Config {
        database_path: std::env::var("GATEHOUSE_DB").unwrap_or_else(|_| "gatehouse.db".into()),
        refresh_interval_secs: std::env::var("GATEHOUSE_REFRESH_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .unwrap_or(60),
        keyring_file: std::env::var("GATEHOUSE_KEYRING_FILE").ok(),
    })
}
