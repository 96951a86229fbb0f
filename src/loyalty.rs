//! Token ledger service: issuance and redemption of restaurant loyalty
//! currency against the conserved token supply.
//!
//! Issuance is reserve-then-credit and redemption is debit-then-release; in
//! both directions the second step rolls the first back on failure, so a
//! partial failure never burns supply or strands a balance. The
//! [`TokenLedger::issue_for_confirmed_payment`] capability is the single
//! auto-issuance hook shared by the payment confirmation path and the
//! distribution sweeper.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::instrument;

use crate::directory::OrderDirectory;
use crate::ledger::{LedgerError, LedgerStore, NewToken};
use crate::types::{
    LoyaltyToken, PaymentTransaction, PublicKey, RestaurantId, TokenId, TokenTransaction,
    TokenTxKind, UserId,
};

#[derive(thiserror::Error, Debug)]
pub enum LoyaltyError {
    /// The user has no verified wallet to receive tokens.
    #[error("User wallet not found or not verified: {0}")]
    WalletNotVerified(UserId),
    /// Remaining supply cannot cover the requested issuance.
    #[error("Not enough tokens available in supply")]
    SupplyExhausted,
    /// The token is deactivated and cannot be redeemed.
    #[error("Token is not active")]
    TokenInactive,
    #[error("Issue and redeem amounts must be positive")]
    ZeroAmount,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A holder row reported by [`TokenLedger::token_holders`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHolder {
    pub user_id: UserId,
    pub balance: u64,
    /// This holder's share of circulating supply, percent with 2 decimals.
    pub percentage: Decimal,
}

/// Request body for token creation. `issuer_address` is optional; when
/// absent the service's configured issuing account is stamped on the token.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateToken {
    pub restaurant_id: RestaurantId,
    pub token_code: String,
    pub asset_code: String,
    #[serde(default)]
    pub issuer_address: Option<PublicKey>,
    pub total_supply: u64,
    pub tokens_per_dollar: Decimal,
    pub redemption_value: Option<Decimal>,
    pub expiration_days: Option<u32>,
}

pub struct TokenLedger {
    store: Arc<LedgerStore>,
    directory: Arc<dyn OrderDirectory>,
    /// Issuing account stamped on tokens created without an explicit issuer.
    issuer_address: PublicKey,
}

impl TokenLedger {
    pub fn new(
        store: Arc<LedgerStore>,
        directory: Arc<dyn OrderDirectory>,
        issuer_address: PublicKey,
    ) -> Self {
        TokenLedger {
            store,
            directory,
            issuer_address,
        }
    }

    /// Creates a restaurant loyalty token with a fixed total supply.
    #[instrument(skip_all, err, fields(token_code = %new.token_code))]
    pub fn create_token(&self, new: CreateToken) -> Result<LoyaltyToken, LoyaltyError> {
        let issuer_address = new
            .issuer_address
            .unwrap_or_else(|| self.issuer_address.clone());
        let token = self.store.create_token(NewToken {
            restaurant_id: new.restaurant_id,
            token_code: new.token_code,
            asset_code: new.asset_code,
            issuer_address,
            total_supply: new.total_supply,
            tokens_per_dollar: new.tokens_per_dollar,
            redemption_value: new.redemption_value,
            expiration_days: new.expiration_days,
        })?;
        tracing::info!(token_id = %token.id, total_supply = token.total_supply, "Loyalty token created");
        Ok(token)
    }

    /// Issues `amount` tokens to a user with a verified wallet.
    ///
    /// Reserve-then-credit is the atomic unit: a failed credit releases the
    /// reservation before the error propagates.
    #[instrument(skip_all, err, fields(user_id = %user_id, token_id = %token_id, amount))]
    pub fn issue_tokens(
        &self,
        user_id: &UserId,
        token_id: TokenId,
        amount: u64,
        description: &str,
        order_id: Option<crate::types::OrderId>,
    ) -> Result<TokenTransaction, LoyaltyError> {
        if amount == 0 {
            return Err(LoyaltyError::ZeroAmount);
        }
        self.store
            .token(token_id)
            .ok_or(LedgerError::TokenNotFound(token_id))?;
        self.store
            .verified_wallet_for(user_id)
            .ok_or_else(|| LoyaltyError::WalletNotVerified(user_id.clone()))?;

        if !self.store.reserve_supply(token_id, amount)? {
            return Err(LoyaltyError::SupplyExhausted);
        }
        let balance = match self.store.credit_balance(user_id, token_id, amount) {
            Ok(balance) => balance,
            Err(e) => {
                // Undo the reservation so a partial failure never burns supply.
                let _ = self.store.release_supply(token_id, amount);
                return Err(e.into());
            }
        };
        let tx = self.store.record_token_tx(
            token_id,
            user_id,
            amount,
            TokenTxKind::Earned,
            order_id,
            description,
        );
        tracing::info!(balance = balance.balance, "Issued loyalty tokens");
        Ok(tx)
    }

    /// Redeems `amount` tokens from a user's balance of an active token.
    #[instrument(skip_all, err, fields(user_id = %user_id, token_id = %token_id, amount))]
    pub fn redeem_tokens(
        &self,
        user_id: &UserId,
        token_id: TokenId,
        amount: u64,
    ) -> Result<TokenTransaction, LoyaltyError> {
        if amount == 0 {
            return Err(LoyaltyError::ZeroAmount);
        }
        let token = self
            .store
            .token(token_id)
            .ok_or(LedgerError::TokenNotFound(token_id))?;
        if !token.is_active {
            return Err(LoyaltyError::TokenInactive);
        }
        let balance = self.store.debit_balance(user_id, token_id, amount)?;
        if let Err(e) = self.store.release_supply(token_id, amount) {
            // Give the tokens back rather than leave supply out of step with
            // the balance.
            let _ = self.store.credit_balance(user_id, token_id, amount);
            return Err(e.into());
        }
        let tx = self.store.record_token_tx(
            token_id,
            user_id,
            amount,
            TokenTxKind::Redeemed,
            None,
            "Tokens redeemed for reward",
        );
        tracing::info!(balance = balance.balance, "Redeemed loyalty tokens");
        Ok(tx)
    }

    /// Auto-issuance hook for a confirmed payment, used identically by the
    /// confirmation path and the distribution sweeper. The caller must hold
    /// the distribution claim for this row.
    ///
    /// Missing restaurant token, unknown payer, unverified wallet, and a
    /// zero token count are recoverable business conditions: the hook logs
    /// and returns `Ok(None)` rather than failing the payment.
    #[instrument(skip_all, err, fields(transaction_id = %payment.id, order_id = %payment.order_id))]
    pub async fn issue_for_confirmed_payment(
        &self,
        payment: &PaymentTransaction,
    ) -> Result<Option<TokenTransaction>, LoyaltyError> {
        let Some(restaurant_id) = self
            .directory
            .restaurant_for_order(&payment.order_id)
            .await
        else {
            tracing::warn!("No restaurant mapping for order; skipping token issuance");
            return Ok(None);
        };
        let Some(token) = self.store.active_token_for_restaurant(&restaurant_id) else {
            tracing::warn!(restaurant_id = %restaurant_id, "No active loyalty token for restaurant");
            return Ok(None);
        };
        let Some(user_id) = self.directory.user_for_order(&payment.order_id).await else {
            tracing::warn!("No payer mapping for order; skipping token issuance");
            return Ok(None);
        };
        if self.store.verified_wallet_for(&user_id).is_none() {
            tracing::warn!(user_id = %user_id, "Payer wallet not found or not verified");
            return Ok(None);
        }

        let tokens_to_issue = tokens_for_purchase(payment.amount_in_usd, token.tokens_per_dollar);
        if tokens_to_issue == 0 {
            tracing::debug!("Purchase too small to earn tokens");
            return Ok(None);
        }
        let tx = self.issue_tokens(
            &user_id,
            token.id,
            tokens_to_issue,
            "Tokens issued for purchase",
            Some(payment.order_id.clone()),
        )?;
        tracing::info!(user_id = %user_id, tokens = tokens_to_issue, "Issued loyalty tokens for payment");
        Ok(Some(tx))
    }

    /// Token metadata by code; only active tokens are addressable by code.
    pub fn token_info(&self, token_code: &str) -> Option<LoyaltyToken> {
        self.store.token_by_code(token_code).filter(|t| t.is_active)
    }

    /// Holders of a token, largest balance first, with each holder's share
    /// of circulating supply.
    pub fn token_holders(&self, token_id: TokenId) -> Result<Vec<TokenHolder>, LoyaltyError> {
        let token = self
            .store
            .token(token_id)
            .ok_or(LedgerError::TokenNotFound(token_id))?;
        let circulating = Decimal::from(token.circulating_supply);
        let holders = self
            .store
            .balances_for_token(token_id)
            .into_iter()
            .map(|b| {
                let mut percentage = if circulating.is_zero() {
                    Decimal::ZERO
                } else {
                    (Decimal::from(b.balance) / circulating * Decimal::ONE_HUNDRED).round_dp(2)
                };
                // Fixed two-decimal scale on the wire.
                percentage.rescale(2);
                TokenHolder {
                    user_id: b.user_id,
                    balance: b.balance,
                    percentage,
                }
            })
            .collect();
        Ok(holders)
    }
}

/// Tokens awarded for a purchase: `floor(amountInUSD * tokensPerDollar)`.
fn tokens_for_purchase(amount_in_usd: Decimal, tokens_per_dollar: Decimal) -> u64 {
    (amount_in_usd * tokens_per_dollar)
        .floor()
        .to_u64()
        .unwrap_or(0)
}
