use anyhow::{anyhow, bail, Context, Result};
use cn_core::config;
use reqwest::Url;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_AUTH_TIME_WINDOW_SECONDS: u64 = 600;
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub addr: SocketAddr,
    /// `ws://` or `wss://` URL of the relay being fronted.
    pub upstream_url: String,
    /// What clients are expected to put in the AUTH `relay` tag.
    pub relay_public_url: String,
    pub forward_client_ip: bool,
    pub auth_time_window_seconds: u64,
    pub idle_timeout: Duration,
    pub send_auth_on_connect: bool,
    pub allowed_client_kinds: Option<Vec<u32>>,
}

impl ProxyConfig {
    pub fn new(upstream_url: impl Into<String>) -> Self {
        let upstream_url = upstream_url.into();
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            relay_public_url: upstream_url.clone(),
            upstream_url,
            forward_client_ip: false,
            auth_time_window_seconds: DEFAULT_AUTH_TIME_WINDOW_SECONDS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECONDS),
            send_auth_on_connect: true,
            allowed_client_kinds: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let addr = config::socket_addr_from_env("AUTH_PROXY_ADDR", DEFAULT_ADDR)?;
        let https = config::flag_from_env("UPSTREAM_HTTPS", false)?;
        let upstream_url = resolve_upstream(&config::required_env("UPSTREAM_RELAY")?, https)?;
        let relay_public_url = match config::optional_env("RELAY_PUBLIC_URL") {
            Some(url) => Url::parse(&url)
                .with_context(|| format!("invalid RELAY_PUBLIC_URL: {url}"))?
                .to_string(),
            None => upstream_url.clone(),
        };
        let allowed_client_kinds = config::optional_env("CLIENT_ALLOWED_KINDS")
            .map(|raw| parse_kinds(&raw))
            .transpose()
            .context("invalid CLIENT_ALLOWED_KINDS")?;

        Ok(Self {
            addr,
            upstream_url,
            relay_public_url,
            forward_client_ip: config::flag_from_env("X_FORWARDED_FOR", false)?,
            auth_time_window_seconds: config::u64_from_env(
                "AUTH_TIME_WINDOW_SECONDS",
                DEFAULT_AUTH_TIME_WINDOW_SECONDS,
            )?,
            idle_timeout: Duration::from_secs(config::u64_from_env(
                "IDLE_TIMEOUT_SECONDS",
                DEFAULT_IDLE_TIMEOUT_SECONDS,
            )?),
            send_auth_on_connect: config::flag_from_env("SEND_AUTH_ON_CONNECT", true)?,
            allowed_client_kinds,
        })
    }

    /// The NIP-11 document lives at the same place over plain HTTP(S).
    pub fn upstream_http_url(&self) -> Result<String> {
        http_url_for(&self.upstream_url)
    }
}

/// Accepts either a full WebSocket URL or a bare `host[:port][/path]`, in
/// which case `https` picks `wss` over `ws`.
pub fn resolve_upstream(raw: &str, https: bool) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("upstream relay is empty");
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        let scheme = if https { "wss" } else { "ws" };
        format!("{scheme}://{raw}")
    };
    let url = Url::parse(&candidate).with_context(|| format!("invalid upstream relay: {raw}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url.to_string()),
        other => Err(anyhow!("upstream relay must use ws or wss, got {other}")),
    }
}

pub fn http_url_for(ws_url: &str) -> Result<String> {
    let mut url = Url::parse(ws_url).with_context(|| format!("invalid upstream relay: {ws_url}"))?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => bail!("unexpected upstream scheme {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {ws_url} to {scheme}"))?;
    Ok(url.to_string())
}

/// Comma separated list, e.g. `1,4,7`. Blank entries are skipped.
pub fn parse_kinds(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<u32>()
                .map_err(|err| anyhow!("invalid kind {entry}: {err}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    struct EnvGuard {
        keys: Vec<&'static str>,
    }

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            for (key, value) in vars {
                env::set_var(key, value);
            }
            Self {
                keys: vars.iter().map(|(key, _)| *key).collect(),
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in &self.keys {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn bare_host_uses_https_flag() {
        assert_eq!(
            resolve_upstream("relay.example", true).unwrap(),
            "wss://relay.example/"
        );
        assert_eq!(
            resolve_upstream("localhost:7000/nostr", false).unwrap(),
            "ws://localhost:7000/nostr"
        );
        assert_eq!(
            resolve_upstream("wss://relay.example", false).unwrap(),
            "wss://relay.example/"
        );
    }

    #[test]
    fn upstream_must_be_websocket() {
        assert!(resolve_upstream("https://relay.example", false).is_err());
        assert!(resolve_upstream("  ", false).is_err());
    }

    #[test]
    fn http_url_swaps_scheme() {
        assert_eq!(
            http_url_for("wss://relay.example/").unwrap(),
            "https://relay.example/"
        );
        assert_eq!(
            http_url_for("ws://127.0.0.1:7000/").unwrap(),
            "http://127.0.0.1:7000/"
        );
    }

    #[test]
    fn parse_kinds_skips_blanks_and_rejects_garbage() {
        assert_eq!(parse_kinds("1, 4,,7").unwrap(), vec![1, 4, 7]);
        assert!(parse_kinds("1,four").is_err());
    }

    // Process-wide env keys: keep every scenario in this one test.
    #[test]
    fn from_env_reads_defaults_and_overrides() {
        {
            let _guard = EnvGuard::set(&[("UPSTREAM_RELAY", "relay.example")]);
            let config = ProxyConfig::from_env().unwrap();
            assert_eq!(config.addr, DEFAULT_ADDR.parse().unwrap());
            assert_eq!(config.upstream_url, "ws://relay.example/");
            assert_eq!(config.relay_public_url, "ws://relay.example/");
            assert!(config.send_auth_on_connect);
            assert!(!config.forward_client_ip);
            assert_eq!(config.idle_timeout, Duration::from_secs(600));
            assert_eq!(config.allowed_client_kinds, None);
        }
        {
            let _guard = EnvGuard::set(&[
                ("UPSTREAM_RELAY", "relay.example"),
                ("UPSTREAM_HTTPS", "true"),
                ("RELAY_PUBLIC_URL", "wss://Public.example"),
                ("X_FORWARDED_FOR", "1"),
                ("AUTH_TIME_WINDOW_SECONDS", "30"),
                ("IDLE_TIMEOUT_SECONDS", "5"),
                ("SEND_AUTH_ON_CONNECT", "false"),
                ("CLIENT_ALLOWED_KINDS", "1,4"),
            ]);
            let config = ProxyConfig::from_env().unwrap();
            assert_eq!(config.upstream_url, "wss://relay.example/");
            assert_eq!(config.relay_public_url, "wss://public.example/");
            assert!(config.forward_client_ip);
            assert_eq!(config.auth_time_window_seconds, 30);
            assert_eq!(config.idle_timeout, Duration::from_secs(5));
            assert!(!config.send_auth_on_connect);
            assert_eq!(config.allowed_client_kinds, Some(vec![1, 4]));
        }
    }
}
