use serde::Deserialize;
use dotenvy::dotenv;
use std::env;

#[derive(Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub admin_secret: String,
    pub control_plane_url: String,
    pub event_sink_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenv().is_ok();

        let port = env::var("PORT")
            .expect("PORT missing, it is required")
            .parse()
            .expect("PORT must be a valid u16 number");

        let database_url = env::var("DATABASE_URL")
            .expect("DATABASE_URL missing, it is required");

        let admin_secret = env::var("ADMIN_SECRET")
            .expect("ADMIN_SECRET missing, it is required");

        let control_plane_url = env::var("CONTROL_PLANE_URL")
            .expect("CONTROL_PLANE_URL missing, it is required");

        let event_sink_url = env::var("EVENT_SINK_URL")
            .expect("EVENT_SINK_URL missing, it is required");

        Self {
            port,
            database_url,
            admin_secret,
            control_plane_url,
            event_sink_url,
        }
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}
