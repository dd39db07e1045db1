//! Process-wide configuration.
//!
//! The configuration is read once, either from an explicit [`configure`] call
//! made before the first trie operation or lazily from the environment.

use std::env;
use std::sync::OnceLock;

use crate::arena::Arena;
use crate::error::ConfigError;

pub const ENV_ARENA_CAPACITY: &str = "VTRIE_ARENA_CAPACITY";
pub const ENV_MAX_KEY_LEN: &str = "VTRIE_MAX_KEY_LEN";
pub const ENV_OUTPUT_BUFFER_LEN: &str = "VTRIE_OUTPUT_BUFFER_LEN";
pub const ENV_RECLAIMER_THREAD: &str = "VTRIE_RECLAIMER_THREAD";

/// Default upper bound on key length in bytes.
pub const DEFAULT_MAX_KEY_LEN: usize = 4096;

/// Default name of the reclamation worker thread.
pub const DEFAULT_RECLAIMER_THREAD: &str = "vtrie-reclaimer";

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Byte limit of the global arena, `None` for unlimited.
    pub arena_capacity: Option<usize>,
    /// Longest key accepted by `insert` and `remove`. Longer keys are never
    /// present, so lookups simply miss.
    pub max_key_len: usize,
    /// Length of buffers handed out by [`BufferPool::output`](crate::BufferPool::output).
    pub output_buffer_len: usize,
    /// Name given to the reclamation worker thread.
    pub reclaimer_thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arena_capacity: None,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            output_buffer_len: DEFAULT_MAX_KEY_LEN,
            reclaimer_thread_name: DEFAULT_RECLAIMER_THREAD.to_owned(),
        }
    }
}

impl Config {
    /// Builds a configuration from `VTRIE_*` environment variables, falling
    /// back to the defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let parse = |var: &'static str| -> Result<Option<usize>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidValue { var, value }),
            }
        };

        let mut config = Config::default();
        config.arena_capacity = parse(ENV_ARENA_CAPACITY)?;
        if let Some(max_key_len) = parse(ENV_MAX_KEY_LEN)? {
            config.max_key_len = max_key_len;
            config.output_buffer_len = max_key_len;
        }
        if let Some(output_len) = parse(ENV_OUTPUT_BUFFER_LEN)? {
            config.output_buffer_len = output_len;
        }
        if let Some(name) = lookup(ENV_RECLAIMER_THREAD) {
            config.reclaimer_thread_name = name;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_key_len == 0 {
            return Err(ConfigError::ZeroKeyLen);
        }
        if self.output_buffer_len < self.max_key_len {
            return Err(ConfigError::OutputTooSmall {
                output_len: self.output_buffer_len,
                max_key_len: self.max_key_len,
            });
        }
        Ok(())
    }
}

/// Installs `config` for the whole process.
///
/// Must run before anything reads the configuration; afterwards
/// [`ConfigError::AlreadyInstalled`] is returned and the active
/// configuration stays in place.
pub fn configure(config: Config) -> Result<(), ConfigError> {
    config.validate()?;
    let capacity = config.arena_capacity;
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInstalled)?;
    if let Some(capacity) = capacity {
        Arena::global().set_capacity(capacity);
    }
    tracing::debug!(?capacity, "vtrie configuration installed");
    Ok(())
}

/// The active configuration.
///
/// An invalid environment is reported and replaced by the defaults.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        let config = Config::from_env().unwrap_or_else(|err| {
            tracing::error!(%err, "ignoring invalid vtrie environment configuration");
            Config::default()
        });
        if let Some(capacity) = config.arena_capacity {
            Arena::global().set_capacity(capacity);
        }
        config
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let vars: HashMap<&'static str, String> =
            vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn key_len_raises_output_len() {
        let config = Config::from_lookup(lookup(&[(ENV_MAX_KEY_LEN, "64")])).unwrap();
        assert_eq!(config.max_key_len, 64);
        assert_eq!(config.output_buffer_len, 64);
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            (ENV_ARENA_CAPACITY, "1048576"),
            (ENV_MAX_KEY_LEN, "128"),
            (ENV_OUTPUT_BUFFER_LEN, "256"),
            (ENV_RECLAIMER_THREAD, "gc"),
        ]))
        .unwrap();
        assert_eq!(config.arena_capacity, Some(1 << 20));
        assert_eq!(config.max_key_len, 128);
        assert_eq!(config.output_buffer_len, 256);
        assert_eq!(config.reclaimer_thread_name, "gc");
    }

    #[test]
    fn rejects_garbage() {
        let err = Config::from_lookup(lookup(&[(ENV_MAX_KEY_LEN, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: ENV_MAX_KEY_LEN,
                value: "lots".to_owned()
            }
        );
    }

    #[test]
    fn rejects_short_output_buffers() {
        let err = Config::from_lookup(lookup(&[
            (ENV_MAX_KEY_LEN, "128"),
            (ENV_OUTPUT_BUFFER_LEN, "64"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::OutputTooSmall {
                output_len: 64,
                max_key_len: 128
            }
        );
    }
}
