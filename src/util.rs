use tracing::level_filters::LevelFilter;

const SECRET_KEY: &str = "GUARDIA_SECRET_KEY";

/// Passphrase used to derive the channel secret encryption key
pub fn get_secret_key() -> Option<String> {
    let key_from_env = std::env::var(SECRET_KEY);
    key_from_env.ok().filter(|key| !key.is_empty())
}

const LOG_LEVEL: &str = "GUARDIA_LOG";

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn get_log_level() -> LevelFilter {
    let level_from_env = std::env::var(LOG_LEVEL);
    level_from_env.map_or(DEFAULT_LOG_LEVEL, |res| {
        res.parse().unwrap_or(DEFAULT_LOG_LEVEL)
    })
}
