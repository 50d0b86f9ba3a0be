use slog::o;
use slog::Drain;
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::sync::Arc;

mod crypto;
mod error;
mod logging;
mod models;
mod oauth;
mod restore;
mod service;
mod spotify;
mod store;
#[cfg(test)]
mod testutil;

pub use error::{Error, Result};

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    // The "base" logger that everything branches off of. Level and format
    // come straight from the environment since the logger exists before
    // config is constructed.
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = env_or("LOG_LEVEL", "INFO")
                .parse()
                .expect("invalid log_level");
        if env_or("LOG_FORMAT", "json").to_lowercase().trim() == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "tunebacker"));
}

/// All process configuration, loaded once at startup and passed by
/// reference. Business logic never reads the environment directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub client_url: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_auth_url: String,
    pub spotify_token_url: String,
    pub spotify_api_base_url: String,
    pub spotify_scopes: String,
    pub db_url: String,
    pub enc_key: String,
    pub storage_url: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub session_ttl_seconds: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            client_url: env_or("CLIENT_URL", "http://localhost:3000"),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", "fake"),
            spotify_client_secret: env_or("SPOTIFY_CLIENT_SECRET", "fake"),
            spotify_auth_url: env_or(
                "SPOTIFY_AUTH_URL",
                "https://accounts.spotify.com/authorize",
            ),
            spotify_token_url: env_or(
                "SPOTIFY_TOKEN_URL",
                "https://accounts.spotify.com/api/token",
            ),
            spotify_api_base_url: env_or("SPOTIFY_API_BASE_URL", "https://api.spotify.com/v1"),
            spotify_scopes: env_or(
                "SPOTIFY_OAUTH_SCOPES",
                "user-read-private user-read-email playlist-read-private \
                 playlist-modify-private playlist-modify-public",
            ),
            db_url: env_or("DATABASE_URL", "error"),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),
            storage_url: env_or("STORAGE_URL", "http://localhost:8000/storage/v1"),
            storage_bucket: env_or("STORAGE_BUCKET", "playlist_files"),
            storage_key: env_or("STORAGE_KEY", "fake"),
            session_ttl_seconds: env_or("SESSION_TTL_SECONDS", "2592000")
                .parse()
                .expect("invalid session_ttl_seconds"),
        }
    }

    pub fn initialize(&self) {
        slog::info!(
            LOG, "initialized config";
            "version" => &self.version,
            "ssl" => &self.ssl,
            "host" => &self.host,
            "port" => &self.port,
            "log_format" => &self.log_format,
            "log_level" => &self.log_level,
            "client_url" => &self.client_url,
        );
    }

    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }

    pub fn redirect_host(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }

    pub fn spotify_redirect_url(&self) -> String {
        format!("{}/auth", self.redirect_host())
    }

    pub fn domain(&self) -> String {
        self.host.clone()
    }
}

#[async_std::main]
async fn main() -> Result<()> {
    // try sourcing a .env if it exists
    dotenv::dotenv().ok();
    let config = Arc::new(Config::from_env());
    config.initialize();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::Db(format!("migration error: {}", e)))?;

    let pg = Arc::new(store::Pg::new(pool.clone()));
    let cipher = Arc::new(crypto::AeadCipher::new(&config.enc_key)?);
    let spotify_client = Arc::new(spotify::SpotifyClient::new(&config));
    let blobs = Arc::new(store::HttpBlobStore::new(&config));
    let engine = Arc::new(oauth::FlowEngine::new(
        oauth::OauthConfig {
            authorize_url: config.spotify_auth_url.clone(),
            redirect_uri: config.spotify_redirect_url(),
            client_id: config.spotify_client_id.clone(),
            scopes: config.spotify_scopes.clone(),
        },
        spotify_client,
        pg.clone(),
        pg.clone(),
        pg,
        blobs,
        cipher,
    ));
    let sessions = Arc::new(store::PgSessionStore::new(pool, &config));

    service::start(service::Context {
        engine,
        sessions,
        config,
    })
    .await
    .map_err(|e| Error::Http(format!("server error: {}", e)))?;
    Ok(())
}
