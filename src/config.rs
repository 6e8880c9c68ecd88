use std::env;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base URL echoed in OAI request elements.
    pub base_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8081);
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/sharedindex".to_string()),
            base_url: env::var("OAI_BASE_URL")
                .unwrap_or_else(|_| format!("http://localhost:{}", port)),
            port,
        }
    }
}
