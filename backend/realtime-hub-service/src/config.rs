use crate::error::{AppError, AppResult};
use dotenvy::dotenv;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Postgres for records, Redis for the schedule index and backplane
    Postgres,
    /// Process-local stores and backplane; single instance only
    Memory,
}

impl FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(AppError::Config(format!(
                "STORAGE_BACKEND must be 'postgres' or 'memory', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Re-index overdue unsent notifications (duplicate delivery over lost delivery)
    pub recover_unsent: bool,
    pub recovery_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            recover_unsent: true,
            recovery_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub enabled: bool,
    pub random_interval: Duration,
    pub broadcast_interval: Duration,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            random_interval: Duration::from_secs(30),
            broadcast_interval: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub instance_id: String,
    pub backplane_channel: String,
    pub scheduler: SchedulerConfig,
    pub demo: DemoConfig,
    pub frontend_url: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage", &self.storage)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("database_max_connections", &self.database_max_connections)
            .field("redis_url", &self.redis_url)
            .field("instance_id", &self.instance_id)
            .field("backplane_channel", &self.backplane_channel)
            .field("scheduler", &self.scheduler)
            .field("demo", &self.demo)
            .field("frontend_url", &self.frontend_url)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            storage: StorageBackend::Memory,
            database_url: None,
            database_max_connections: 10,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            instance_id: format!("hub-{}", uuid::Uuid::new_v4().simple()),
            backplane_channel: pubsub_backplane::DEFAULT_CHANNEL.to_string(),
            scheduler: SchedulerConfig::default(),
            demo: DemoConfig::default(),
            frontend_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenv().ok();
        let defaults = Config::default();

        let storage = match env::var("STORAGE_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) => StorageBackend::Postgres,
        };

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(AppError::Config("DATABASE_URL missing".into()));
        }

        let instance_id = env::var("INSTANCE_ID")
            .or_else(|_| env::var("HOSTNAME"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.instance_id);

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(parse_env(
                "SCHEDULER_POLL_INTERVAL_SECS",
                defaults.scheduler.poll_interval.as_secs(),
            )?),
            recover_unsent: parse_bool_env(
                "SCHEDULER_RECOVER_UNSENT",
                defaults.scheduler.recover_unsent,
            )?,
            recovery_grace: Duration::from_secs(parse_env(
                "SCHEDULER_RECOVERY_GRACE_SECS",
                defaults.scheduler.recovery_grace.as_secs(),
            )?),
        };
        if scheduler.poll_interval.is_zero() {
            return Err(AppError::Config(
                "SCHEDULER_POLL_INTERVAL_SECS must be greater than 0".into(),
            ));
        }

        let demo = DemoConfig {
            enabled: parse_bool_env("DEMO_NOTIFICATIONS_ENABLED", defaults.demo.enabled)?,
            random_interval: Duration::from_secs(parse_env(
                "DEMO_RANDOM_INTERVAL_SECS",
                defaults.demo.random_interval.as_secs(),
            )?),
            broadcast_interval: Duration::from_secs(parse_env(
                "DEMO_BROADCAST_INTERVAL_SECS",
                defaults.demo.broadcast_interval.as_secs(),
            )?),
        };
        if demo.enabled && (demo.random_interval.is_zero() || demo.broadcast_interval.is_zero()) {
            return Err(AppError::Config(
                "DEMO_*_INTERVAL_SECS must be greater than 0".into(),
            ));
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT", defaults.port)?,
            storage,
            database_url,
            database_max_connections: parse_env(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            instance_id,
            backplane_channel: env::var("BACKPLANE_CHANNEL")
                .unwrap_or(defaults.backplane_channel),
            scheduler,
            demo,
            frontend_url: env::var("FRONTEND_URL").ok().filter(|v| !v.is_empty()),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::Config(format!(
                "{key} must be a boolean, got '{raw}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "STORAGE_BACKEND",
        "DATABASE_URL",
        "PORT",
        "INSTANCE_ID",
        "SCHEDULER_POLL_INTERVAL_SECS",
        "SCHEDULER_RECOVER_UNSENT",
        "DEMO_NOTIFICATIONS_ENABLED",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn memory_backend_uses_defaults() {
        clear();
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("INSTANCE_ID", "node-1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.port, 3001);
        assert_eq!(config.instance_id, "node-1");
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(10));
        assert!(config.scheduler.recover_unsent);
        assert!(!config.demo.enabled);
        clear();
    }

    #[test]
    #[serial]
    fn postgres_backend_requires_database_url() {
        clear();
        env::set_var("STORAGE_BACKEND", "postgres");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        clear();
    }

    #[test]
    #[serial]
    fn invalid_numbers_are_rejected() {
        clear();
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("PORT", "not-a-port");

        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));
        clear();
    }

    #[test]
    #[serial]
    fn booleans_accept_common_spellings() {
        clear();
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("SCHEDULER_RECOVER_UNSENT", "off");
        env::set_var("DEMO_NOTIFICATIONS_ENABLED", "1");

        let config = Config::from_env().unwrap();
        assert!(!config.scheduler.recover_unsent);
        assert!(config.demo.enabled);
        clear();
    }

    #[test]
    fn debug_redacts_database_url() {
        let config = Config {
            database_url: Some("postgres://user:secret@db/hub".into()),
            ..Config::default()
        };
        let printed = format!("{config:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("[REDACTED]"));
    }
}
