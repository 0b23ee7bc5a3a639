use std::{
    net::{IpAddr, Ipv4Addr},
    sync::LazyLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;
use veil::Redact;

pub static CONFIG: LazyLock<DynAppConfig> = LazyLock::new(get_config);

#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct DynAppConfig {
    // ------------- SERVER -------------
    pub listen_port: u16,
    pub bind_ip: IpAddr,
    /// Requests taking longer are answered with `408`.
    pub max_request_time_secs: u64,
    pub max_request_body_size: usize,

    // ------------- POSTGRES -------------
    /// Read replica. Falls back to the write connection if not set.
    pub pg_database_url_read: Option<String>,
    pub pg_database_url_write: Option<String>,
    pub pg_read_pool_connections: u32,
    pub pg_write_pool_connections: u32,
    /// Seconds to wait for a connection from the pool.
    pub pg_acquire_timeout: u64,

    // ------------- COLLABORATORS -------------
    pub gcp: GcpConfig,
    pub open: OpenModeConfig,
    pub bi: BiConfig,

    // ------------- WORKFLOW QUEUE -------------
    /// Milliseconds between two polls of an idle workflow worker.
    pub task_poll_interval_ms: u64,
    /// Number of workflow workers started by `serve`.
    pub worker_count: usize,
    /// Number of deliveries after which a job that keeps losing its worker is failed.
    pub max_job_attempts: i32,
    /// A running job that has not finished after this many seconds is considered
    /// abandoned by its worker and is delivered again.
    pub max_time_since_pickup_secs: i64,

    pub debug: DebugConfig,
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct GcpConfig {
    /// Project that owns the dataset-specific service accounts.
    pub project_id: String,
    /// Custom role granted on project level to every restricted service account,
    /// e.g. `projects/my-project/roles/biQueryRunner`.
    pub restricted_project_role: String,
    /// Prefix of derived service account ids. Must start with a lowercase letter.
    pub service_account_prefix: String,
}

#[derive(Clone, Deserialize, Serialize, PartialEq, Redact)]
pub struct OpenModeConfig {
    /// The shared "all-users" service account used by every open binding.
    pub service_account_email: String,
    /// JSON key of the shared service account, handed to the BI tool.
    #[redact]
    pub service_account_key: String,
    /// Id of the BI tool's built-in "All Users" permission group.
    pub all_users_group_id: i64,
}

#[derive(Clone, Deserialize, Serialize, PartialEq, Redact)]
pub struct BiConfig {
    pub url: Option<Url>,
    pub username: String,
    #[redact]
    pub password: String,
    /// Suffix every restricted collection name must carry.
    pub restricted_collection_marker: String,
    /// Seconds to wait for the BI tool to discover a freshly bound table.
    pub database_sync_timeout_secs: u64,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct DebugConfig {
    /// Add file and line numbers to log lines.
    pub extended_logs: bool,
    /// Log request and response bodies at debug level. Expensive.
    pub log_request_bodies: bool,
}

impl Default for DynAppConfig {
    fn default() -> Self {
        Self {
            listen_port: 8181,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_request_time_secs: 30,
            max_request_body_size: 2 * 1024 * 1024,
            pg_database_url_read: None,
            pg_database_url_write: None,
            pg_read_pool_connections: 10,
            pg_write_pool_connections: 5,
            pg_acquire_timeout: 5,
            gcp: GcpConfig::default(),
            open: OpenModeConfig::default(),
            bi: BiConfig::default(),
            task_poll_interval_ms: 1000,
            worker_count: 4,
            max_job_attempts: 3,
            max_time_since_pickup_secs: 30 * 60,
            debug: DebugConfig::default(),
        }
    }
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            restricted_project_role: String::new(),
            service_account_prefix: "dp".to_string(),
        }
    }
}

impl Default for OpenModeConfig {
    fn default() -> Self {
        Self {
            service_account_email: String::new(),
            service_account_key: String::new(),
            all_users_group_id: 1,
        }
    }
}

impl Default for BiConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: String::new(),
            password: String::new(),
            restricted_collection_marker: "🔐".to_string(),
            database_sync_timeout_secs: 300,
        }
    }
}

impl DynAppConfig {
    #[must_use]
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    #[must_use]
    pub fn max_time_since_pickup(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_time_since_pickup_secs)
    }

    #[must_use]
    pub fn max_request_time(&self) -> Duration {
        Duration::from_secs(self.max_request_time_secs)
    }

    #[must_use]
    pub fn bind_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_ip, self.listen_port)
    }
}

impl BiConfig {
    #[must_use]
    pub fn database_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.database_sync_timeout_secs)
    }
}

fn get_config() -> DynAppConfig {
    let defaults = figment::providers::Serialized::defaults(DynAppConfig::default());

    #[cfg(not(test))]
    let prefixes = &["DATAPORT__"];
    #[cfg(test)]
    let prefixes = &["DATAPORT_TEST__"];

    let mut config = figment::Figment::from(defaults);
    for prefix in prefixes {
        let env = figment::providers::Env::prefixed(prefix).split("__");
        config = config.merge(env);
    }

    match config.extract::<DynAppConfig>() {
        Ok(c) => c,
        Err(e) => {
            panic!("Failed to extract Dataport config: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        figment::Jail::expect_with(|_jail| {
            let config = get_config();
            assert_eq!(config.listen_port, 8181);
            assert_eq!(config.open.all_users_group_id, 1);
            assert_eq!(config.bi.restricted_collection_marker, "🔐");
            assert_eq!(config.gcp.service_account_prefix, "dp");
            assert_eq!(config.task_poll_interval(), Duration::from_secs(1));
            Ok(())
        });
    }

    #[test]
    fn test_nested_env_vars() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DATAPORT_TEST__GCP__PROJECT_ID", "catalog-prod");
            jail.set_env("DATAPORT_TEST__OPEN__ALL_USERS_GROUP_ID", "7");
            jail.set_env("DATAPORT_TEST__BI__URL", "https://bi.example.com");
            jail.set_env("DATAPORT_TEST__WORKER_COUNT", "12");
            let config = get_config();
            assert_eq!(config.gcp.project_id, "catalog-prod");
            assert_eq!(config.open.all_users_group_id, 7);
            assert_eq!(
                config.bi.url.as_ref().map(Url::as_str),
                Some("https://bi.example.com/")
            );
            assert_eq!(config.worker_count, 12);
            Ok(())
        });
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = BiConfig {
            password: "hunter2".to_string(),
            ..BiConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));

        let open = OpenModeConfig {
            service_account_key: "{\"private_key\": \"secret\"}".to_string(),
            ..OpenModeConfig::default()
        };
        assert!(!format!("{open:?}").contains("secret"));
    }
}
