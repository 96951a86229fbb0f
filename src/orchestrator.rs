//! Payment orchestrator: the state machine driving a blockchain payment from
//! initiation through confirmation and optional refund.
//!
//! The orchestrator owns no state of its own. Every mutation goes through the
//! [`LedgerStore`]'s conditional primitives, so the same confirmation can be
//! raced by the pending poller without corrupting the row: whichever caller
//! first observes `PENDING` wins and the loser sees the benign
//! already-terminal outcome. Loyalty issuance after confirmation is
//! best-effort behind the distribution claim; its failure never fails the
//! payment.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::directory::{OrderDirectory, WalletAuth};
use crate::ledger::{LedgerError, LedgerStore, NewPayment, Transition};
use crate::loyalty::TokenLedger;
use crate::rates::{RateCache, RateError};
use crate::timestamp::UnixTimestamp;
use crate::types::{
    Asset, OrderId, PaymentTransaction, PublicKey, RestaurantId, TransactionStatus,
    TransactionType, TxHash, UserId, Wallet, WalletType,
};
use crate::verifier::{ChainVerifier, VerifierError};

/// Stellar base fee, denominated in XLM.
const BASE_FEE: Decimal = Decimal::from_parts(1, 0, 0, false, 5);

#[derive(thiserror::Error, Debug)]
pub enum PaymentError {
    /// Malformed input rejected before touching the store.
    #[error("Invalid payment amount: {0}")]
    InvalidAmount(Decimal),
    /// No `PENDING` transaction exists for the order.
    #[error("Pending transaction not found for order {0}")]
    NoPendingTransaction(OrderId),
    /// No ledger row carries this network hash.
    #[error("Transaction not found: {0}")]
    UnknownHash(TxHash),
    /// The ordering subsystem does not know this order.
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),
    /// The restaurant has no provisioned receiving address.
    #[error("No receiving address for restaurant {0}")]
    NoReceivingAddress(RestaurantId),
    /// The chain rejected the submitted hash; the row is now `FAILED`.
    #[error("Transaction validation failed: {0}")]
    VerificationFailed(String),
    /// The verifier could not be reached; the row is left `PENDING`.
    #[error("Chain verifier unavailable: {0}")]
    VerifierUnavailable(String),
    /// Refunds require the original transaction to be a confirmed payment.
    #[error("Cannot refund transaction in status {0}")]
    NotRefundable(TransactionStatus),
    /// The wallet-ownership challenge signature did not verify.
    #[error("Invalid wallet signature")]
    InvalidSignature,
    #[error(transparent)]
    Rate(#[from] RateError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Request to start a payment; `amount` is the order total in USD.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePayment {
    pub order_id: OrderId,
    pub asset: Asset,
    pub amount: Decimal,
    pub memo: Option<String>,
}

/// Everything a wallet needs to submit the payment on-chain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedPayment {
    pub transaction_id: crate::types::TransactionId,
    /// Amount in asset units at the current exchange rate.
    pub amount: Decimal,
    pub destination: PublicKey,
    pub memo: String,
    pub asset: Asset,
    #[serde(rename = "amountInUSD")]
    pub amount_in_usd: Decimal,
    /// Advisory payment window; enforced by the expiry sweeper for rows that
    /// never receive a hash.
    pub expires_at: UnixTimestamp,
}

/// Request to bind a submitted transaction hash to a pending payment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPayment {
    pub order_id: OrderId,
    pub transaction_hash: TxHash,
}

/// Request to verify and register a wallet.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWallet {
    pub public_key: PublicKey,
    pub wallet_type: WalletType,
    pub signature: String,
    pub challenge: String,
    /// Authenticated caller identity; a fresh id is minted when absent.
    pub user_id: Option<UserId>,
}

/// Outcome of a confirmation attempt.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// This call performed the `PENDING` -> `CONFIRMED` transition.
    Confirmed(PaymentTransaction),
    /// Another caller already finished the row; benign race outcome.
    AlreadyTerminal(PaymentTransaction),
}

impl ConfirmOutcome {
    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            ConfirmOutcome::Confirmed(tx) | ConfirmOutcome::AlreadyTerminal(tx) => tx,
        }
    }
}

/// A simulated Horizon account balance line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    pub issuer: Option<PublicKey>,
    pub balance: Decimal,
    pub limit: Option<Decimal>,
}

pub struct PaymentOrchestrator {
    store: Arc<LedgerStore>,
    rates: Arc<RateCache>,
    verifier: Arc<dyn ChainVerifier>,
    wallet_auth: Arc<dyn WalletAuth>,
    directory: Arc<dyn OrderDirectory>,
    loyalty: Arc<TokenLedger>,
    /// Seconds until an initiated payment's advisory window lapses.
    payment_expiry_secs: u64,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<LedgerStore>,
        rates: Arc<RateCache>,
        verifier: Arc<dyn ChainVerifier>,
        wallet_auth: Arc<dyn WalletAuth>,
        directory: Arc<dyn OrderDirectory>,
        loyalty: Arc<TokenLedger>,
        payment_expiry_secs: u64,
    ) -> Self {
        PaymentOrchestrator {
            store,
            rates,
            verifier,
            wallet_auth,
            directory,
            loyalty,
            payment_expiry_secs,
        }
    }

    /// Starts a payment: converts the USD order total into the requested
    /// asset and records a `PENDING` ledger row.
    #[instrument(skip_all, err, fields(order_id = %request.order_id, asset = %request.asset))]
    pub async fn initiate_payment(
        &self,
        request: InitiatePayment,
    ) -> Result<InitiatedPayment, PaymentError> {
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(request.amount));
        }
        let restaurant_id = self
            .directory
            .restaurant_for_order(&request.order_id)
            .await
            .ok_or_else(|| PaymentError::UnknownOrder(request.order_id.clone()))?;
        let destination = self
            .directory
            .receiving_address(&restaurant_id)
            .await
            .ok_or(PaymentError::NoReceivingAddress(restaurant_id))?;

        let crypto_amount = self.rates.usd_to_asset(request.asset, request.amount).await?;
        let memo = request
            .memo
            .unwrap_or_else(|| format!("ORDER-{}", request.order_id.memo_prefix()));
        let expires_at = UnixTimestamp::now() + self.payment_expiry_secs;

        let tx = self.store.create_pending_payment(NewPayment {
            order_id: request.order_id,
            asset: request.asset,
            amount: crypto_amount,
            amount_in_usd: request.amount,
            fee: BASE_FEE,
            to_address: destination.clone(),
            memo: memo.clone(),
            expires_at,
        })?;
        tracing::info!(transaction_id = %tx.id, amount = %crypto_amount, "Payment initiated");

        Ok(InitiatedPayment {
            transaction_id: tx.id,
            amount: crypto_amount,
            destination,
            memo,
            asset: tx.asset,
            amount_in_usd: tx.amount_in_usd,
            expires_at,
        })
    }

    /// Verifies a submitted hash against the chain and finishes the pending
    /// row for the order.
    ///
    /// Idempotent: a retry after the row went terminal reports the existing
    /// row instead of erroring, and the distribution claim guarantees loyalty
    /// tokens are issued at most once however many confirmers race.
    #[instrument(skip_all, err, fields(order_id = %request.order_id))]
    pub async fn confirm_payment(
        &self,
        request: ConfirmPayment,
    ) -> Result<ConfirmOutcome, PaymentError> {
        let ConfirmPayment {
            order_id,
            transaction_hash: hash,
        } = request;
        let Some(pending) = self.store.pending_for_order(&order_id) else {
            // Retried confirmation: the hash may already be bound to a
            // terminal row for this order.
            if let Some(existing) = self.store.transaction_by_hash(&hash)
                && existing.order_id == order_id
                && existing.status.is_terminal()
            {
                tracing::debug!(status = %existing.status, "Confirmation retry on terminal row");
                return Ok(ConfirmOutcome::AlreadyTerminal(existing));
            }
            return Err(PaymentError::NoPendingTransaction(order_id));
        };

        match self.verifier.verify(&hash).await {
            Ok(facts) => match self.store.transition_to_confirmed(pending.id, hash, &facts)? {
                Transition::Applied(tx) => {
                    self.distribute_for(&tx).await;
                    tracing::info!(transaction_id = %tx.id, "Payment confirmed");
                    Ok(ConfirmOutcome::Confirmed(tx))
                }
                Transition::AlreadyTerminal(status) => {
                    tracing::debug!(%status, "Lost confirmation race; treating as settled elsewhere");
                    let tx = self
                        .store
                        .transaction(pending.id)
                        .ok_or_else(|| LedgerError::TransactionNotFound(pending.id.to_string()))?;
                    Ok(ConfirmOutcome::AlreadyTerminal(tx))
                }
            },
            Err(VerifierError::Rejected(reason)) => {
                // CAS failure transition; a concurrent winner makes this a no-op.
                let _ = self.store.transition_to_failed(pending.id)?;
                Err(PaymentError::VerificationFailed(reason))
            }
            Err(VerifierError::Unavailable(reason)) => {
                Err(PaymentError::VerifierUnavailable(reason))
            }
        }
    }

    /// Best-effort loyalty issuance behind the distribution claim. Never
    /// fails the enclosing confirmation.
    async fn distribute_for(&self, tx: &PaymentTransaction) {
        match self.store.claim_for_distribution(tx.id) {
            Ok(true) => {
                if let Err(e) = self.loyalty.issue_for_confirmed_payment(tx).await {
                    tracing::error!(error = %e, transaction_id = %tx.id, "Loyalty issuance failed; payment stays confirmed");
                }
            }
            Ok(false) => {
                tracing::debug!(transaction_id = %tx.id, "Distribution already claimed");
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not claim distribution");
            }
        }
    }

    /// Creates and settles a refund row for a confirmed payment.
    ///
    /// The refund is a new ledger row with the transfer direction swapped; it
    /// starts `PENDING` and passes through the same verifier path as
    /// payments before confirming.
    #[instrument(skip_all, err, fields(original_hash = %hash))]
    pub async fn process_refund(&self, hash: TxHash) -> Result<PaymentTransaction, PaymentError> {
        let original = self
            .store
            .transaction_by_hash(&hash)
            .ok_or_else(|| PaymentError::UnknownHash(hash.clone()))?;
        if original.status != TransactionStatus::Confirmed
            || original.transaction_type != TransactionType::Payment
        {
            return Err(PaymentError::NotRefundable(original.status));
        }

        let refund_hash = TxHash(format!("REFUND-{hash}"));
        let refund = self.store.insert_refund(&original, refund_hash.clone())?;
        match self.verifier.verify(&refund_hash).await {
            Ok(facts) => {
                match self
                    .store
                    .transition_to_confirmed(refund.id, refund_hash, &facts)?
                {
                    Transition::Applied(tx) => {
                        tracing::info!(refund_id = %tx.id, original_id = %original.id, "Refund settled");
                        Ok(tx)
                    }
                    Transition::AlreadyTerminal(_) => Ok(self
                        .store
                        .transaction(refund.id)
                        .ok_or_else(|| LedgerError::TransactionNotFound(refund.id.to_string()))?),
                }
            }
            Err(VerifierError::Rejected(reason)) => {
                let _ = self.store.transition_to_failed(refund.id)?;
                Err(PaymentError::VerificationFailed(reason))
            }
            Err(VerifierError::Unavailable(reason)) => {
                Err(PaymentError::VerifierUnavailable(reason))
            }
        }
    }

    /// Verifies wallet ownership and upserts the wallet row.
    #[instrument(skip_all, err, fields(public_key = %request.public_key))]
    pub fn connect_wallet(&self, request: ConnectWallet) -> Result<Wallet, PaymentError> {
        if !self
            .wallet_auth
            .verify(&request.public_key, &request.challenge, &request.signature)
        {
            return Err(PaymentError::InvalidSignature);
        }
        let user_id = request
            .user_id
            .or_else(|| {
                self.store
                    .wallet_by_key(&request.public_key)
                    .map(|w| w.user_id)
            })
            .unwrap_or_else(|| UserId(Uuid::new_v4().to_string()));
        let wallet = self
            .store
            .upsert_wallet(user_id, request.public_key, request.wallet_type);
        tracing::info!(wallet_id = %wallet.id, "Wallet connected");
        Ok(wallet)
    }

    /// Simulated Horizon balances for a connected address. A production
    /// deployment would query Horizon here.
    pub fn wallet_balances(&self, _public_key: &PublicKey) -> Vec<AssetBalance> {
        vec![
            AssetBalance {
                asset: "XLM".to_string(),
                issuer: None,
                balance: Decimal::new(10050, 2),
                limit: None,
            },
            AssetBalance {
                asset: "USDC".to_string(),
                issuer: Some(PublicKey::from(
                    "GA5ZSEJYB37JRC5AVCIA5MOP4RHTM335X2KGX3IHOJAPP5RE34K4KZVN",
                )),
                balance: Decimal::new(50000, 2),
                limit: Some(Decimal::new(1000000, 2)),
            },
        ]
    }

    /// Ledger rows touching an address, newest first.
    pub fn wallet_transactions(
        &self,
        public_key: &PublicKey,
        limit: usize,
    ) -> Vec<PaymentTransaction> {
        self.store.transactions_for_address(public_key, limit)
    }

    pub fn transaction_by_hash(&self, hash: &TxHash) -> Option<PaymentTransaction> {
        self.store.transaction_by_hash(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{PermissiveWalletAuth, StaticDirectory};
    use crate::loyalty::CreateToken;
    use crate::rates::FixedPriceFeed;
    use crate::verifier::{ChainFacts, HorizonStub};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct RejectingVerifier;

    #[async_trait]
    impl ChainVerifier for RejectingVerifier {
        async fn verify(&self, _hash: &TxHash) -> Result<ChainFacts, VerifierError> {
            Err(VerifierError::Rejected("no such transaction".into()))
        }
    }

    struct Fixture {
        store: Arc<LedgerStore>,
        loyalty: Arc<TokenLedger>,
        orchestrator: PaymentOrchestrator,
    }

    fn fixture_with_verifier(verifier: Arc<dyn ChainVerifier>) -> Fixture {
        let store = Arc::new(LedgerStore::new());
        let directory = Arc::new(StaticDirectory::new(
            RestaurantId::from("r1"),
            PublicKey::from("GRESTAURANT"),
            Some(UserId::from("u1")),
        ));
        let rates = Arc::new(RateCache::new(
            Box::new(FixedPriceFeed::new(dec!(0.10), dec!(1.00))),
            Duration::from_secs(30),
        ));
        let loyalty = Arc::new(TokenLedger::new(
            store.clone(),
            directory.clone(),
            PublicKey::from("GISSUER"),
        ));
        let orchestrator = PaymentOrchestrator::new(
            store.clone(),
            rates,
            verifier,
            Arc::new(PermissiveWalletAuth),
            directory,
            loyalty.clone(),
            180,
        );
        Fixture {
            store,
            loyalty,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_verifier(Arc::new(HorizonStub))
    }

    fn initiate(order: &str, usd: Decimal) -> InitiatePayment {
        InitiatePayment {
            order_id: OrderId::from(order),
            asset: Asset::Xlm,
            amount: usd,
            memo: None,
        }
    }

    fn chip_token() -> CreateToken {
        CreateToken {
            restaurant_id: RestaurantId::from("r1"),
            token_code: "CHIP".to_string(),
            asset_code: "CHIP".to_string(),
            issuer_address: None,
            total_supply: 1000,
            tokens_per_dollar: dec!(5),
            redemption_value: None,
            expiration_days: None,
        }
    }

    #[tokio::test]
    async fn test_initiate_converts_usd_at_current_rate() {
        let f = fixture();
        let initiated = f
            .orchestrator
            .initiate_payment(initiate("order-1", dec!(10.00)))
            .await
            .unwrap();
        assert_eq!(initiated.amount, dec!(100));
        assert_eq!(initiated.amount_in_usd, dec!(10.00));
        assert_eq!(initiated.destination, PublicKey::from("GRESTAURANT"));
        assert_eq!(initiated.memo, "ORDER-order-1");
        let row = f.store.transaction(initiated.transaction_id).unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert!(row.transaction_hash.is_none());
    }

    #[tokio::test]
    async fn test_initiate_rejects_duplicate_pending_order() {
        let f = fixture();
        f.orchestrator
            .initiate_payment(initiate("o1", dec!(10.00)))
            .await
            .unwrap();
        let err = f
            .orchestrator
            .initiate_payment(initiate("o1", dec!(10.00)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Ledger(LedgerError::DuplicatePendingOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_initiate_rejects_non_positive_amount() {
        let f = fixture();
        let err = f
            .orchestrator
            .initiate_payment(initiate("o1", dec!(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_confirm_transitions_and_issues_tokens_once() {
        let f = fixture();
        f.store.upsert_wallet(
            UserId::from("u1"),
            PublicKey::from("GPAYER"),
            WalletType::Freighter,
        );
        let token = f.loyalty.create_token(chip_token()).unwrap();
        f.orchestrator
            .initiate_payment(initiate("o1", dec!(10.00)))
            .await
            .unwrap();

        let request = ConfirmPayment {
            order_id: OrderId::from("o1"),
            transaction_hash: TxHash::from("deadbeef"),
        };
        let outcome = f.orchestrator.confirm_payment(request.clone()).await.unwrap();
        let tx = match outcome {
            ConfirmOutcome::Confirmed(tx) => tx,
            other => panic!("expected fresh confirmation, got {other:?}"),
        };
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert!(tx.block_number.is_some());

        // 10 USD at 5 tokens/dollar credits the payer exactly 50 tokens.
        let balance = f.store.balance(&UserId::from("u1"), token.id).unwrap();
        assert_eq!(balance.balance, 50);

        // A retried confirmation is benign and does not double-issue.
        let retry = f.orchestrator.confirm_payment(request).await.unwrap();
        assert!(matches!(retry, ConfirmOutcome::AlreadyTerminal(_)));
        let balance = f.store.balance(&UserId::from("u1"), token.id).unwrap();
        assert_eq!(balance.balance, 50);
    }

    #[tokio::test]
    async fn test_confirm_without_pending_row_is_not_found() {
        let f = fixture();
        let err = f
            .orchestrator
            .confirm_payment(ConfirmPayment {
                order_id: OrderId::from("missing"),
                transaction_hash: TxHash::from("deadbeef"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NoPendingTransaction(_)));
    }

    #[tokio::test]
    async fn test_rejected_verification_fails_the_row() {
        let f = fixture_with_verifier(Arc::new(RejectingVerifier));
        let initiated = f
            .orchestrator
            .initiate_payment(initiate("o1", dec!(10.00)))
            .await
            .unwrap();
        let err = f
            .orchestrator
            .confirm_payment(ConfirmPayment {
                order_id: OrderId::from("o1"),
                transaction_hash: TxHash::from("bogus"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::VerificationFailed(_)));
        assert_eq!(
            f.store.transaction(initiated.transaction_id).unwrap().status,
            TransactionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_refund_requires_confirmed_original() {
        let f = fixture();
        f.orchestrator
            .initiate_payment(initiate("o1", dec!(10.00)))
            .await
            .unwrap();
        // Pending rows have no hash yet, so the refund lookup misses.
        let err = f
            .orchestrator
            .process_refund(TxHash::from("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnknownHash(_)));
    }

    #[tokio::test]
    async fn test_refund_swaps_addresses_and_keeps_amount() {
        let f = fixture();
        f.orchestrator
            .initiate_payment(initiate("o1", dec!(10.00)))
            .await
            .unwrap();
        let confirmed = f
            .orchestrator
            .confirm_payment(ConfirmPayment {
                order_id: OrderId::from("o1"),
                transaction_hash: TxHash::from("deadbeef"),
            })
            .await
            .unwrap();
        let original = confirmed.transaction().clone();

        let refund = f
            .orchestrator
            .process_refund(TxHash::from("deadbeef"))
            .await
            .unwrap();
        assert_eq!(refund.transaction_type, TransactionType::Refund);
        assert_eq!(refund.status, TransactionStatus::Confirmed);
        assert_eq!(refund.amount, original.amount);
        assert_eq!(refund.from_address, Some(original.to_address.clone()));
        assert_eq!(Some(refund.to_address.clone()), original.from_address);
        assert_ne!(refund.id.0, original.id.0);
        assert_eq!(refund.memo, format!("REFUND-{}", original.memo));

        // Refunding twice conflicts on the refund hash.
        let err = f
            .orchestrator
            .process_refund(TxHash::from("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Ledger(LedgerError::DuplicateHash(_))
        ));
    }

    #[tokio::test]
    async fn test_refund_of_a_refund_is_not_refundable() {
        let f = fixture();
        f.orchestrator
            .initiate_payment(initiate("o1", dec!(10.00)))
            .await
            .unwrap();
        f.orchestrator
            .confirm_payment(ConfirmPayment {
                order_id: OrderId::from("o1"),
                transaction_hash: TxHash::from("deadbeef"),
            })
            .await
            .unwrap();
        f.orchestrator
            .process_refund(TxHash::from("deadbeef"))
            .await
            .unwrap();
        let err = f
            .orchestrator
            .process_refund(TxHash::from("REFUND-deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotRefundable(_)));
    }

    #[test]
    fn test_connect_wallet_rejects_bad_signature() {
        let f = fixture();
        let err = f
            .orchestrator
            .connect_wallet(ConnectWallet {
                public_key: PublicKey::from("GABC"),
                wallet_type: WalletType::Freighter,
                signature: String::new(),
                challenge: "challenge".to_string(),
                user_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature));
    }

    #[test]
    fn test_connect_wallet_mints_identity_when_absent() {
        let f = fixture();
        let wallet = f
            .orchestrator
            .connect_wallet(ConnectWallet {
                public_key: PublicKey::from("GABC"),
                wallet_type: WalletType::Lobstr,
                signature: "sig".to_string(),
                challenge: "challenge".to_string(),
                user_id: None,
            })
            .unwrap();
        assert!(wallet.is_verified);
        assert!(!wallet.user_id.as_str().is_empty());

        // Reconnecting keeps the minted identity.
        let again = f
            .orchestrator
            .connect_wallet(ConnectWallet {
                public_key: PublicKey::from("GABC"),
                wallet_type: WalletType::Freighter,
                signature: "sig".to_string(),
                challenge: "challenge".to_string(),
                user_id: None,
            })
            .unwrap();
        assert_eq!(again.user_id, wallet.user_id);
    }
}
