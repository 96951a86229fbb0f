//! Application wiring: one struct owning every service the HTTP layer and
//! the background jobs share.

use std::sync::Arc;

use crate::config::Config;
use crate::directory::{OrderDirectory, PermissiveWalletAuth, StaticDirectory, WalletAuth};
use crate::ledger::LedgerStore;
use crate::loyalty::TokenLedger;
use crate::orchestrator::PaymentOrchestrator;
use crate::rates::{FixedPriceFeed, PriceFeed, RateCache};
use crate::verifier::{ChainVerifier, HorizonStub};

pub struct App {
    pub config: Config,
    pub store: Arc<LedgerStore>,
    pub rates: Arc<RateCache>,
    pub verifier: Arc<dyn ChainVerifier>,
    pub loyalty: Arc<TokenLedger>,
    pub orchestrator: PaymentOrchestrator,
}

impl App {
    /// Wires the service graph around injectable seams. Production wraps
    /// this in [`App::from_config`]; tests swap in their own feed, verifier,
    /// or directory.
    pub fn new(
        config: Config,
        feed: Box<dyn PriceFeed>,
        verifier: Arc<dyn ChainVerifier>,
        wallet_auth: Arc<dyn WalletAuth>,
        directory: Arc<dyn OrderDirectory>,
    ) -> Self {
        let store = Arc::new(LedgerStore::new());
        let rates = Arc::new(RateCache::new(feed, config.rate_cache_ttl()));
        let loyalty = Arc::new(TokenLedger::new(
            store.clone(),
            directory.clone(),
            config.loyalty_token_issuer_public_key.clone(),
        ));
        let orchestrator = PaymentOrchestrator::new(
            store.clone(),
            rates.clone(),
            verifier.clone(),
            wallet_auth,
            directory,
            loyalty.clone(),
            config.payment_expiry_secs,
        );
        App {
            config,
            store,
            rates,
            verifier,
            loyalty,
            orchestrator,
        }
    }

    /// Default wiring: simulated chain access and the deployment's single
    /// restaurant from configuration.
    pub fn from_config(config: Config) -> Self {
        let directory = Arc::new(StaticDirectory::new(
            config.restaurant_id.clone(),
            config.restaurant_wallet_public_key.clone(),
            config.default_user_id.clone(),
        ));
        App::new(
            config,
            Box::new(FixedPriceFeed::default()),
            Arc::new(HorizonStub),
            Arc::new(PermissiveWalletAuth),
            directory,
        )
    }
}
