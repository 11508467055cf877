use std::{env, net::SocketAddr, time::Duration};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Output token budget passed to the upstream on every call.
    pub max_tokens: u32,
    /// Longest wait for the next upstream chunk.
    pub upstream_idle_timeout: Duration,
    /// Hard cap on a single relayed stream.
    pub max_stream_lifetime: Duration,
    pub fake_stream_pacing: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_tokens: 20,
            upstream_idle_timeout: Duration::from_secs(30),
            max_stream_lifetime: Duration::from_secs(300),
            fake_stream_pacing: Duration::from_millis(100),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            bind_addr: read(&lookup, "RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_tokens: read(&lookup, "RELAY_MAX_TOKENS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_tokens),
            upstream_idle_timeout: read(&lookup, "RELAY_UPSTREAM_IDLE_TIMEOUT_SECS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_idle_timeout),
            max_stream_lifetime: read(&lookup, "RELAY_MAX_STREAM_LIFETIME_SECS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_stream_lifetime),
            fake_stream_pacing: read(&lookup, "RELAY_FAKE_STREAM_PACING_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.fake_stream_pacing),
        }
    }
}

fn read<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(name).and_then(|value| value.trim().parse::<T>().ok())
}
