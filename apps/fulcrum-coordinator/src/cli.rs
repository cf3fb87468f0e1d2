use std::time::Duration;

/// Every timeout on this struct is env-overridable and defaults to the
/// values documented for the fleet coordination core; see
/// `fulcrum-registry::heartbeat` and `fulcrum-dispatch::dispatcher` for
/// where each one lands.
#[derive(clap::Parser, Debug)]
pub struct Cli {
    #[clap(long, env = "REDIS_URL", default_value = "redis://127.0.0.1/")]
    pub redis_url: String,

    #[clap(long, env, default_value = "5000")]
    pub unavailable_timeout_ms: u64,

    #[clap(long, env, default_value = "30000")]
    pub dead_timeout_ms: u64,

    #[clap(long, env, default_value = "60000")]
    pub snapshot_ttl_ms: u64,

    #[clap(long, env, default_value = "1000")]
    pub sweep_period_ms: u64,

    #[clap(long, env, default_value = "5000")]
    pub request_timeout_ms: u64,

    #[clap(long, env, default_value = "30000")]
    pub registering_watchdog_ms: u64,

    #[clap(long, env, default_value = "5000")]
    pub slot_cooldown_ms: u64,
}

impl Cli {
    pub fn unavailable_timeout(&self) -> Duration {
        Duration::from_millis(self.unavailable_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn registering_watchdog(&self) -> Duration {
        Duration::from_millis(self.registering_watchdog_ms)
    }
}
