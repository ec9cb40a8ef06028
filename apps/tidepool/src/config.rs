use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

/// Tidepool client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on login/signup round trips before the attempt is
    /// abandoned with a timeout error.
    pub login_timeout: Duration,
    /// First delay of the push-resubscribe backoff schedule.
    pub resync_base: Duration,
    /// Ceiling of the push-resubscribe backoff schedule.
    pub resync_max: Duration,
    /// Buffer size of each subscription's event channel.
    pub event_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            login_timeout: env_millis("TIDEPOOL_LOGIN_TIMEOUT_MS")
                .unwrap_or(defaults.login_timeout),
            resync_base: env_millis("TIDEPOOL_RESYNC_BASE_MS").unwrap_or(defaults.resync_base),
            resync_max: env_millis("TIDEPOOL_RESYNC_MAX_MS").unwrap_or(defaults.resync_max),
            event_buffer: env::var("TIDEPOOL_EVENT_BUFFER")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.event_buffer),
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(10),
            resync_base: Duration::from_millis(500),
            resync_max: Duration::from_secs(8),
            event_buffer: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.login_timeout, Duration::from_secs(10));
        assert_eq!(config.resync_base, Duration::from_millis(500));
        assert_eq!(config.resync_max, Duration::from_secs(8));
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe {
            env::remove_var("TIDEPOOL_LOGIN_TIMEOUT_MS");
        }
        let config = Config::from_env();
        assert_eq!(config.login_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe {
            env::set_var("TIDEPOOL_LOGIN_TIMEOUT_MS", "2500");
            env::set_var("TIDEPOOL_EVENT_BUFFER", "32");
        }
        let config = Config::from_env();
        assert_eq!(config.login_timeout, Duration::from_millis(2500));
        assert_eq!(config.event_buffer, 32);

        unsafe {
            env::remove_var("TIDEPOOL_LOGIN_TIMEOUT_MS");
            env::remove_var("TIDEPOOL_EVENT_BUFFER");
        }
    }

    #[test]
    fn test_config_ignores_unparseable_values() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe {
            env::set_var("TIDEPOOL_RESYNC_BASE_MS", "not-a-number");
        }
        let config = Config::from_env();
        assert_eq!(config.resync_base, Duration::from_millis(500));

        unsafe {
            env::remove_var("TIDEPOOL_RESYNC_BASE_MS");
        }
    }
}
