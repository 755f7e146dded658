//! Process configuration (§4.10, §ServiceConfig of SPEC_FULL.md).
//!
//! Grounded on `estuary-flow/crates/oidc-discovery-server`'s `Args`: a
//! `clap::Parser` struct reading CLI flags with environment-variable fallbacks.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(
    name = "reactive-collections-server",
    about = "Reactive collections engine with an HTTP/SSE front door"
)]
pub struct Args {
    #[clap(long, env = "RC_BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    #[clap(long, env = "RC_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Per-subscriber bounded queue capacity (§4.7).
    #[clap(long, env = "RC_QUEUE_CAPACITY", default_value_t = 64)]
    pub queue_capacity: usize,

    /// Idle-instance sweep interval, in seconds. Disabled by `--disable-idle-sweep`.
    #[clap(long, env = "RC_IDLE_SWEEP_SECS", default_value_t = 300)]
    pub idle_sweep_secs: u64,

    #[clap(long, env = "RC_DISABLE_IDLE_SWEEP")]
    pub disable_idle_sweep: bool,

    #[clap(long, env = "RC_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Args {
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .expect("bind address and port must form a valid socket address")
    }

    pub fn idle_sweep_interval(&self) -> Option<Duration> {
        if self.disable_idle_sweep {
            None
        } else {
            Some(Duration::from_secs(self.idle_sweep_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_flags() {
        let args = Args::try_parse_from(["reactive-collections-server"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.queue_capacity, 64);
        assert_eq!(args.idle_sweep_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "reactive-collections-server",
            "--bind-addr",
            "127.0.0.1",
            "--port",
            "9001",
            "--disable-idle-sweep",
        ])
        .unwrap();
        assert_eq!(args.bind_addr, "127.0.0.1");
        assert_eq!(args.port, 9001);
        assert_eq!(args.idle_sweep_interval(), None);
        assert_eq!(args.socket_addr().to_string(), "127.0.0.1:9001");
    }

    #[test]
    fn env_vars_are_honored() {
        // SAFETY: this crate's test binary does not otherwise read `RC_PORT`.
        std::env::set_var("RC_PORT", "9100");
        let args = Args::try_parse_from(["reactive-collections-server"]).unwrap();
        std::env::remove_var("RC_PORT");
        assert_eq!(args.port, 9100);
    }
}
