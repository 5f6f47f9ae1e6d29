use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

pub fn required_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing env: {name}"))
}

/// Unset and blank values both read as `None`.
pub fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn socket_addr_from_env(name: &str, default: &str) -> Result<SocketAddr> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    SocketAddr::from_str(&value).map_err(|err| anyhow!("invalid socket addr for {name}: {err}"))
}

pub fn flag_from_env(name: &str, default: bool) -> Result<bool> {
    match optional_env(name) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid boolean for {name}: {value}")),
        },
    }
}

pub fn u64_from_env(name: &str, default: u64) -> Result<u64> {
    match optional_env(name) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map_err(|err| anyhow!("invalid integer for {name}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        key: &'static str,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.key);
        }
    }

    fn set_env(key: &'static str, value: &str) -> EnvGuard {
        env::set_var(key, value);
        EnvGuard { key }
    }

    #[test]
    fn required_env_missing_returns_error() {
        env::remove_var("CN_TEST_REQUIRED_ENV_MISSING");
        assert!(required_env("CN_TEST_REQUIRED_ENV_MISSING").is_err());
    }

    #[test]
    fn optional_env_treats_blank_as_unset() {
        let _guard = set_env("CN_TEST_OPTIONAL_BLANK", "   ");
        assert_eq!(optional_env("CN_TEST_OPTIONAL_BLANK"), None);
    }

    #[test]
    fn socket_addr_from_env_uses_default() {
        env::remove_var("CN_TEST_SOCKET_DEFAULT");
        let addr = socket_addr_from_env("CN_TEST_SOCKET_DEFAULT", "127.0.0.1:1234").unwrap();
        assert_eq!(addr, "127.0.0.1:1234".parse().unwrap());
    }

    #[test]
    fn socket_addr_from_env_invalid_returns_error() {
        let _guard = set_env("CN_TEST_SOCKET_INVALID", "not-a-socket");
        assert!(socket_addr_from_env("CN_TEST_SOCKET_INVALID", "127.0.0.1:1234").is_err());
    }

    #[test]
    fn flag_from_env_parses_common_spellings() {
        let _guard = set_env("CN_TEST_FLAG_TRUE", "TRUE");
        assert!(flag_from_env("CN_TEST_FLAG_TRUE", false).unwrap());
        env::remove_var("CN_TEST_FLAG_UNSET");
        assert!(flag_from_env("CN_TEST_FLAG_UNSET", true).unwrap());
        let _invalid = set_env("CN_TEST_FLAG_INVALID", "maybe");
        assert!(flag_from_env("CN_TEST_FLAG_INVALID", false).is_err());
    }

    #[test]
    fn u64_from_env_rejects_garbage() {
        let _guard = set_env("CN_TEST_U64_INVALID", "ten");
        assert!(u64_from_env("CN_TEST_U64_INVALID", 10).is_err());
        env::remove_var("CN_TEST_U64_UNSET");
        assert_eq!(u64_from_env("CN_TEST_U64_UNSET", 10).unwrap(), 10);
    }
}
