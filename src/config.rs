//! Runtime configuration, sourced from CLI flags with environment fallback.

use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

use crate::types::{PublicKey, RestaurantId, UserId};

/// Settlement service configuration.
///
/// Every flag falls back to an environment variable, then to the hardcoded
/// default from [`config_defaults`].
#[derive(Parser, Debug, Clone)]
#[command(name = "dinepay")]
#[command(about = "Crypto payment settlement and loyalty token ledger")]
pub struct Config {
    /// Interface to bind the HTTP listener to.
    #[arg(long, env = "HOST", default_value = config_defaults::DEFAULT_HOST)]
    pub host: IpAddr,

    /// Port to bind the HTTP listener to.
    #[arg(long, env = "PORT", default_value_t = config_defaults::DEFAULT_PORT)]
    pub port: u16,

    /// Receiving address payments settle into.
    #[arg(long, env = "RESTAURANT_WALLET_PUBLIC_KEY")]
    pub restaurant_wallet_public_key: PublicKey,

    /// Restaurant this deployment settles for.
    #[arg(long, env = "RESTAURANT_ID")]
    pub restaurant_id: RestaurantId,

    /// Issuer address stamped on loyalty tokens created here.
    #[arg(long, env = "LOYALTY_TOKEN_ISSUER_PUBLIC_KEY")]
    pub loyalty_token_issuer_public_key: PublicKey,

    /// Payer identity assumed for orders when no wallet session exists.
    #[arg(long, env = "DEFAULT_USER_ID")]
    pub default_user_id: Option<UserId>,

    /// Seconds between exchange-rate refreshes.
    #[arg(long, env = "RATE_REFRESH_INTERVAL_SECS", default_value_t = config_defaults::DEFAULT_RATE_REFRESH_SECS)]
    pub rate_refresh_interval_secs: u64,

    /// Exchange-rate cache TTL in seconds.
    #[arg(long, env = "RATE_CACHE_TTL_SECS", default_value_t = config_defaults::DEFAULT_RATE_CACHE_TTL_SECS)]
    pub rate_cache_ttl_secs: u64,

    /// Seconds between pending-transaction verification sweeps.
    #[arg(long, env = "PENDING_POLL_INTERVAL_SECS", default_value_t = config_defaults::DEFAULT_PENDING_POLL_SECS)]
    pub pending_poll_interval_secs: u64,

    /// Seconds between token-distribution sweeps.
    #[arg(long, env = "DISTRIBUTION_SWEEP_INTERVAL_SECS", default_value_t = config_defaults::DEFAULT_DISTRIBUTION_SWEEP_SECS)]
    pub distribution_sweep_interval_secs: u64,

    /// Confirmed payments picked up per distribution sweep.
    #[arg(long, env = "DISTRIBUTION_BATCH_SIZE", default_value_t = config_defaults::DEFAULT_DISTRIBUTION_BATCH)]
    pub distribution_batch_size: usize,

    /// Seconds between sweeps that fail expired hashless payments.
    #[arg(long, env = "EXPIRY_SWEEP_INTERVAL_SECS", default_value_t = config_defaults::DEFAULT_EXPIRY_SWEEP_SECS)]
    pub expiry_sweep_interval_secs: u64,

    /// Seconds between failed-transaction retention sweeps.
    #[arg(long, env = "FAILED_CLEANUP_INTERVAL_SECS", default_value_t = config_defaults::DEFAULT_FAILED_CLEANUP_SECS)]
    pub failed_cleanup_interval_secs: u64,

    /// Days a failed transaction is retained before cleanup.
    #[arg(long, env = "FAILED_RETENTION_DAYS", default_value_t = config_defaults::DEFAULT_FAILED_RETENTION_DAYS)]
    pub failed_retention_days: u64,

    /// Seconds an initiated payment may wait for a hash before expiring.
    #[arg(long, env = "PAYMENT_EXPIRY_SECS", default_value_t = config_defaults::DEFAULT_PAYMENT_EXPIRY_SECS)]
    pub payment_expiry_secs: u64,
}

impl Config {
    pub fn rate_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rate_cache_ttl_secs)
    }
}

pub mod config_defaults {
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_RATE_REFRESH_SECS: u64 = 30;
    pub const DEFAULT_RATE_CACHE_TTL_SECS: u64 = 30;
    pub const DEFAULT_PENDING_POLL_SECS: u64 = 60;
    pub const DEFAULT_DISTRIBUTION_SWEEP_SECS: u64 = 30;
    pub const DEFAULT_DISTRIBUTION_BATCH: usize = 10;
    pub const DEFAULT_EXPIRY_SWEEP_SECS: u64 = 30;
    pub const DEFAULT_FAILED_CLEANUP_SECS: u64 = 86_400;
    pub const DEFAULT_FAILED_RETENTION_DAYS: u64 = 30;
    pub const DEFAULT_PAYMENT_EXPIRY_SECS: u64 = 180;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "dinepay",
            "--restaurant-wallet-public-key",
            "GRESTAURANT",
            "--restaurant-id",
            "r1",
            "--loyalty-token-issuer-public-key",
            "GISSUER",
        ]
    }

    #[test]
    fn test_defaults_apply_without_flags() {
        let config = Config::try_parse_from(base_args()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.pending_poll_interval_secs, 60);
        assert_eq!(config.distribution_batch_size, 10);
        assert_eq!(config.failed_retention_days, 30);
        assert!(config.default_user_id.is_none());
    }

    #[test]
    fn test_flags_override_defaults() {
        let mut args = base_args();
        args.extend(["--port", "9090", "--payment-expiry-secs", "60"]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.payment_expiry_secs, 60);
    }
}
