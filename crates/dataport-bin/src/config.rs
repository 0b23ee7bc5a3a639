//! Switches that only affect how the `dataport` binary starts up. Everything the
//! library needs lives in `dataport::CONFIG`.

use std::sync::LazyLock;

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

#[cfg(not(test))]
const ENV_PREFIX: &str = "DATAPORT__";
#[cfg(test)]
const ENV_PREFIX: &str = "DATAPORT_TEST__";

pub(crate) static CONFIG_BIN: LazyLock<BinConfig> = LazyLock::new(|| {
    load(ENV_PREFIX).unwrap_or_else(|e| panic!("Invalid dataport binary configuration: {e}"))
});

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
pub(crate) struct BinConfig {
    pub(crate) debug: StartupSwitches,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
pub(crate) struct StartupSwitches {
    /// Apply the embedded schema migrations before `serve` opens its pools. Meant for
    /// local setups with a single replica.
    pub(crate) migrate_before_serve: bool,
    /// Treat a bare `dataport` invocation as `dataport serve`. Container images set
    /// this so they need no command line.
    pub(crate) auto_serve: bool,
}

/// Defaults overlaid with `<prefix>DEBUG__<SWITCH>` environment variables.
fn load(prefix: &str) -> Result<BinConfig, figment::Error> {
    Figment::from(Serialized::defaults(BinConfig::default()))
        .merge(Env::prefixed(prefix).split("__"))
        .extract()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_switches_default_off() {
        figment::Jail::expect_with(|_jail| {
            assert_eq!(load(ENV_PREFIX)?, BinConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_switches_from_env() {
        for (migrate, serve) in [("true", "false"), ("false", "true"), ("true", "true")] {
            figment::Jail::expect_with(|jail| {
                jail.set_env("DATAPORT_TEST__DEBUG__MIGRATE_BEFORE_SERVE", migrate);
                jail.set_env("DATAPORT_TEST__DEBUG__AUTO_SERVE", serve);
                let config = load(ENV_PREFIX)?;
                assert_eq!(config.debug.migrate_before_serve, migrate == "true");
                assert_eq!(config.debug.auto_serve, serve == "true");
                Ok(())
            });
        }
    }

    #[test]
    fn test_production_prefix_is_ignored_in_tests() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DATAPORT__DEBUG__AUTO_SERVE", "true");
            assert!(!load(ENV_PREFIX)?.debug.auto_serve);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_switch_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DATAPORT_TEST__DEBUG__AUTO_SERVE", "sometimes");
            assert!(load(ENV_PREFIX).is_err());
            Ok(())
        });
    }
}
