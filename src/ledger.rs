//! The ledger store: owner of the four persistent tables and the append-only
//! token audit log.
//!
//! Every invariant-bearing mutation is a single atomic read-modify-write
//! against one row, implemented through [`DashMap`]'s per-entry exclusivity:
//!
//! - status transitions are compare-and-swap on `PENDING`; the loser of a
//!   race observes [`Transition::AlreadyTerminal`] instead of corrupting the
//!   row,
//! - [`LedgerStore::reserve_supply`] checks and increments circulating supply
//!   in one operation, so concurrent issuances can never over-issue,
//! - [`LedgerStore::claim_for_distribution`] grants exactly one worker
//!   permission to distribute loyalty tokens for a confirmed payment.
//!
//! Lock ordering: a transaction row guard may be held while touching the
//! hash or pending-order indexes, never the reverse.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use std::sync::RwLock;

use crate::timestamp::UnixTimestamp;
use crate::types::{
    Asset, LoyaltyBalance, LoyaltyToken, OrderId, PaymentTransaction, PublicKey, RestaurantId,
    TokenId, TokenTransaction, TokenTxId, TokenTxKind, TransactionId, TransactionStatus,
    TransactionType, TxHash, UserId, Wallet, WalletId, WalletType,
};
use crate::verifier::ChainFacts;

/// Errors raised by store mutations.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    /// A `PENDING` transaction already exists for this order.
    #[error("A pending transaction already exists for order {0}")]
    DuplicatePendingOrder(OrderId),
    /// The network hash is already bound to a different ledger row.
    #[error("Transaction hash already recorded: {0}")]
    DuplicateHash(TxHash),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Token not found: {0}")]
    TokenNotFound(TokenId),
    #[error("Token code already exists: {0}")]
    TokenCodeExists(String),
    /// Debit requested more than the current balance. State is unchanged.
    #[error("Insufficient token balance: available {available}, requested {requested}")]
    InsufficientBalance { available: u64, requested: u64 },
}

/// Outcome of a conditional status transition.
///
/// `AlreadyTerminal` is the benign race outcome: some other caller finished
/// the row first. Callers treat it as success-elsewhere, not an error.
#[derive(Debug, Clone)]
pub enum Transition {
    Applied(PaymentTransaction),
    AlreadyTerminal(TransactionStatus),
}

/// Input for a new pending payment row.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: OrderId,
    pub asset: Asset,
    pub amount: Decimal,
    pub amount_in_usd: Decimal,
    pub fee: Decimal,
    pub to_address: PublicKey,
    pub memo: String,
    pub expires_at: UnixTimestamp,
}

/// Store-level input for a new loyalty token, issuer already resolved.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub restaurant_id: RestaurantId,
    pub token_code: String,
    pub asset_code: String,
    pub issuer_address: PublicKey,
    pub total_supply: u64,
    pub tokens_per_dollar: Decimal,
    pub redemption_value: Option<Decimal>,
    pub expiration_days: Option<u32>,
}

#[derive(Default)]
pub struct LedgerStore {
    transactions: DashMap<TransactionId, PaymentTransaction>,
    tx_by_hash: DashMap<TxHash, TransactionId>,
    pending_by_order: DashMap<OrderId, TransactionId>,
    wallets: DashMap<PublicKey, Wallet>,
    wallet_by_user: DashMap<UserId, PublicKey>,
    tokens: DashMap<TokenId, LoyaltyToken>,
    token_by_code: DashMap<String, TokenId>,
    balances: DashMap<(UserId, TokenId), LoyaltyBalance>,
    token_log: RwLock<Vec<TokenTransaction>>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `PENDING` payment row, enforcing at most one pending
    /// transaction per order.
    pub fn create_pending_payment(
        &self,
        new: NewPayment,
    ) -> Result<PaymentTransaction, LedgerError> {
        let now = UnixTimestamp::now();
        let tx = PaymentTransaction {
            id: TransactionId::new(),
            order_id: new.order_id.clone(),
            transaction_hash: None,
            from_address: None,
            to_address: new.to_address,
            asset: new.asset,
            amount: new.amount,
            amount_in_usd: new.amount_in_usd,
            fee: new.fee,
            status: TransactionStatus::Pending,
            block_number: None,
            ledger_sequence: None,
            memo: new.memo,
            transaction_type: TransactionType::Payment,
            distribution_claimed: false,
            created_at: now,
            confirmed_at: None,
            expires_at: Some(new.expires_at),
        };
        match self.pending_by_order.entry(new.order_id.clone()) {
            Entry::Occupied(_) => Err(LedgerError::DuplicatePendingOrder(new.order_id)),
            Entry::Vacant(slot) => {
                self.transactions.insert(tx.id, tx.clone());
                slot.insert(tx.id);
                Ok(tx)
            }
        }
    }

    /// Inserts a `PENDING` refund row carrying its hash from creation.
    ///
    /// Refund rows do not enter the pending-per-order index: they confirm
    /// through the verifier path driven by their creator, and the one-pending
    /// invariant scopes to payment rows.
    pub fn insert_refund(
        &self,
        original: &PaymentTransaction,
        hash: TxHash,
    ) -> Result<PaymentTransaction, LedgerError> {
        let now = UnixTimestamp::now();
        let tx = PaymentTransaction {
            id: TransactionId::new(),
            order_id: original.order_id.clone(),
            transaction_hash: Some(hash.clone()),
            // Refund swaps the direction of the original transfer.
            from_address: Some(original.to_address.clone()),
            to_address: original
                .from_address
                .clone()
                .unwrap_or_else(|| PublicKey::from("")),
            asset: original.asset,
            amount: original.amount,
            amount_in_usd: original.amount_in_usd,
            fee: original.fee,
            status: TransactionStatus::Pending,
            block_number: None,
            ledger_sequence: None,
            memo: format!("REFUND-{}", original.memo),
            transaction_type: TransactionType::Refund,
            distribution_claimed: false,
            created_at: now,
            confirmed_at: None,
            expires_at: None,
        };
        // Lock order: reserve the hash and drop that guard before touching
        // the transactions map. The hash briefly resolves to a not-yet-stored
        // row; lookups tolerate that by treating a missing row as absent.
        match self.tx_by_hash.entry(hash.clone()) {
            Entry::Occupied(_) => return Err(LedgerError::DuplicateHash(hash)),
            Entry::Vacant(slot) => {
                slot.insert(tx.id);
            }
        }
        self.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    /// Conditionally transitions a `PENDING` row to `CONFIRMED`, stamping the
    /// network facts. Re-invocation on a terminal row is a no-op reporting
    /// [`Transition::AlreadyTerminal`].
    pub fn transition_to_confirmed(
        &self,
        id: TransactionId,
        hash: TxHash,
        facts: &ChainFacts,
    ) -> Result<Transition, LedgerError> {
        let mut row = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))?;
        if row.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal(row.status));
        }
        // Bind the network hash unless this row already owns it (refund rows
        // carry theirs from creation).
        if row.transaction_hash.as_ref() != Some(&hash) {
            match self.tx_by_hash.entry(hash.clone()) {
                Entry::Occupied(existing) if *existing.get() != id => {
                    return Err(LedgerError::DuplicateHash(hash));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }
        row.transaction_hash = Some(hash);
        // Refund rows set their sender at creation; do not clobber it with
        // the observed one.
        if row.from_address.is_none() {
            row.from_address = Some(facts.from_address.clone());
        }
        row.block_number = Some(facts.block_number);
        row.ledger_sequence = Some(facts.ledger_sequence);
        row.confirmed_at = Some(UnixTimestamp::now());
        row.status = TransactionStatus::Confirmed;
        let snapshot = row.clone();
        drop(row);
        self.pending_by_order
            .remove_if(&snapshot.order_id, |_, v| *v == id);
        Ok(Transition::Applied(snapshot))
    }

    /// Conditionally transitions a `PENDING` row to `FAILED`.
    pub fn transition_to_failed(&self, id: TransactionId) -> Result<Transition, LedgerError> {
        let mut row = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))?;
        if row.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal(row.status));
        }
        row.status = TransactionStatus::Failed;
        let snapshot = row.clone();
        drop(row);
        self.pending_by_order
            .remove_if(&snapshot.order_id, |_, v| *v == id);
        Ok(Transition::Applied(snapshot))
    }

    /// Atomically marks a `CONFIRMED` payment as distribution-attempted.
    ///
    /// Returns `false` if the row is not a confirmed payment or another
    /// caller already holds the claim. This is what makes the distribution
    /// sweeper idempotent against the confirmation path.
    pub fn claim_for_distribution(&self, id: TransactionId) -> Result<bool, LedgerError> {
        let mut row = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))?;
        let claimable = row.status == TransactionStatus::Confirmed
            && row.transaction_type == TransactionType::Payment
            && !row.distribution_claimed;
        if claimable {
            row.distribution_claimed = true;
        }
        Ok(claimable)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<PaymentTransaction> {
        self.transactions.get(&id).map(|r| r.clone())
    }

    pub fn transaction_by_hash(&self, hash: &TxHash) -> Option<PaymentTransaction> {
        let id = *self.tx_by_hash.get(hash)?;
        self.transaction(id)
    }

    pub fn pending_for_order(&self, order_id: &OrderId) -> Option<PaymentTransaction> {
        let id = *self.pending_by_order.get(order_id)?;
        self.transaction(id)
    }

    /// Latest transaction recorded for an order, pending or terminal.
    pub fn latest_for_order(&self, order_id: &OrderId) -> Option<PaymentTransaction> {
        self.transactions
            .iter()
            .filter(|r| &r.order_id == order_id)
            .max_by_key(|r| r.created_at)
            .map(|r| r.clone())
    }

    /// Pending rows that already carry a network hash; poller input. In
    /// practice these are refund rows whose verification was interrupted.
    pub fn pending_with_hash(&self) -> Vec<PaymentTransaction> {
        self.transactions
            .iter()
            .filter(|r| r.status == TransactionStatus::Pending && r.transaction_hash.is_some())
            .map(|r| r.clone())
            .collect()
    }

    /// Confirmed payment rows not yet claimed for distribution, capped at
    /// `limit` per sweep.
    pub fn unclaimed_confirmed(&self, limit: usize) -> Vec<PaymentTransaction> {
        self.transactions
            .iter()
            .filter(|r| {
                r.status == TransactionStatus::Confirmed
                    && r.transaction_type == TransactionType::Payment
                    && !r.distribution_claimed
            })
            .take(limit)
            .map(|r| r.clone())
            .collect()
    }

    /// Failed rows created before `cutoff`; cleanup-job input.
    pub fn failed_before(&self, cutoff: UnixTimestamp) -> Vec<PaymentTransaction> {
        self.transactions
            .iter()
            .filter(|r| r.status == TransactionStatus::Failed && r.created_at.is_before(cutoff))
            .map(|r| r.clone())
            .collect()
    }

    /// Pending hashless rows whose advisory window has lapsed; expiry-sweeper
    /// input.
    pub fn stale_pending(&self, now: UnixTimestamp) -> Vec<PaymentTransaction> {
        self.transactions
            .iter()
            .filter(|r| {
                r.status == TransactionStatus::Pending
                    && r.transaction_hash.is_none()
                    && r.expires_at.is_some_and(|exp| exp.is_before(now))
            })
            .map(|r| r.clone())
            .collect()
    }

    /// Ledger rows touching an address, newest first.
    pub fn transactions_for_address(
        &self,
        address: &PublicKey,
        limit: usize,
    ) -> Vec<PaymentTransaction> {
        let mut rows: Vec<PaymentTransaction> = self
            .transactions
            .iter()
            .filter(|r| {
                r.to_address == *address || r.from_address.as_ref() == Some(address)
            })
            .map(|r| r.clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        rows
    }

    /// Inserts or refreshes the wallet row for a public key. Reconnecting an
    /// existing key updates type and verification instead of duplicating.
    pub fn upsert_wallet(
        &self,
        user_id: UserId,
        public_key: PublicKey,
        wallet_type: WalletType,
    ) -> Wallet {
        let now = UnixTimestamp::now();
        let wallet = match self.wallets.entry(public_key.clone()) {
            Entry::Occupied(mut existing) => {
                let w = existing.get_mut();
                w.wallet_type = wallet_type;
                w.is_verified = true;
                w.last_verified_at = Some(now);
                w.updated_at = now;
                w.clone()
            }
            Entry::Vacant(slot) => {
                let w = Wallet {
                    id: WalletId::new(),
                    user_id,
                    public_key,
                    wallet_type,
                    is_verified: true,
                    last_verified_at: Some(now),
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(w.clone());
                w
            }
        };
        self.wallet_by_user
            .insert(wallet.user_id.clone(), wallet.public_key.clone());
        wallet
    }

    pub fn wallet_by_key(&self, public_key: &PublicKey) -> Option<Wallet> {
        self.wallets.get(public_key).map(|w| w.clone())
    }

    pub fn verified_wallet_for(&self, user_id: &UserId) -> Option<Wallet> {
        let key = self.wallet_by_user.get(user_id)?.clone();
        self.wallets
            .get(&key)
            .filter(|w| w.is_verified)
            .map(|w| w.clone())
    }

    /// Creates a loyalty token with zero circulating supply.
    pub fn create_token(&self, new: NewToken) -> Result<LoyaltyToken, LedgerError> {
        let token = LoyaltyToken {
            id: TokenId::new(),
            restaurant_id: new.restaurant_id,
            token_code: new.token_code.clone(),
            asset_code: new.asset_code,
            issuer_address: new.issuer_address,
            total_supply: new.total_supply,
            circulating_supply: 0,
            tokens_per_dollar: new.tokens_per_dollar,
            // Default $0.01 per token.
            redemption_value: new.redemption_value.unwrap_or(Decimal::new(1, 2)),
            expiration_days: new.expiration_days,
            is_active: true,
            created_at: UnixTimestamp::now(),
        };
        match self.token_by_code.entry(new.token_code.clone()) {
            Entry::Occupied(_) => Err(LedgerError::TokenCodeExists(new.token_code)),
            Entry::Vacant(slot) => {
                self.tokens.insert(token.id, token.clone());
                slot.insert(token.id);
                Ok(token)
            }
        }
    }

    pub fn token(&self, id: TokenId) -> Option<LoyaltyToken> {
        self.tokens.get(&id).map(|t| t.clone())
    }

    pub fn token_by_code(&self, code: &str) -> Option<LoyaltyToken> {
        let id = *self.token_by_code.get(code)?;
        self.token(id)
    }

    pub fn active_token_for_restaurant(
        &self,
        restaurant_id: &RestaurantId,
    ) -> Option<LoyaltyToken> {
        self.tokens
            .iter()
            .find(|t| &t.restaurant_id == restaurant_id && t.is_active)
            .map(|t| t.clone())
    }

    /// Activates or deactivates a token. Inactive tokens cannot be redeemed
    /// and are not resolvable by code.
    pub fn set_token_active(&self, id: TokenId, active: bool) -> Result<(), LedgerError> {
        let mut token = self.tokens.get_mut(&id).ok_or(LedgerError::TokenNotFound(id))?;
        token.is_active = active;
        Ok(())
    }

    /// Atomically checks remaining supply and increments circulating supply.
    /// Returns `false` without mutating when the supply cannot cover `amount`.
    pub fn reserve_supply(&self, id: TokenId, amount: u64) -> Result<bool, LedgerError> {
        let mut token = self.tokens.get_mut(&id).ok_or(LedgerError::TokenNotFound(id))?;
        if token.available_supply() < amount {
            return Ok(false);
        }
        token.circulating_supply += amount;
        Ok(true)
    }

    /// Decrements circulating supply on redemption. The amount was validated
    /// against the redeeming balance before this call.
    pub fn release_supply(&self, id: TokenId, amount: u64) -> Result<(), LedgerError> {
        let mut token = self.tokens.get_mut(&id).ok_or(LedgerError::TokenNotFound(id))?;
        token.circulating_supply = token.circulating_supply.saturating_sub(amount);
        Ok(())
    }

    /// Credits a user's balance, creating the row lazily on first issuance.
    pub fn credit_balance(
        &self,
        user_id: &UserId,
        token_id: TokenId,
        amount: u64,
    ) -> Result<LoyaltyBalance, LedgerError> {
        let now = UnixTimestamp::now();
        let mut entry = self
            .balances
            .entry((user_id.clone(), token_id))
            .or_insert_with(|| LoyaltyBalance::empty(user_id.clone(), token_id));
        entry.balance += amount;
        entry.lifetime_earned += amount;
        entry.last_earned_at = Some(now);
        entry.updated_at = now;
        Ok(entry.clone())
    }

    /// Debits a user's balance; fails without mutation when the balance is
    /// short.
    pub fn debit_balance(
        &self,
        user_id: &UserId,
        token_id: TokenId,
        amount: u64,
    ) -> Result<LoyaltyBalance, LedgerError> {
        let mut entry = self
            .balances
            .get_mut(&(user_id.clone(), token_id))
            .ok_or(LedgerError::InsufficientBalance {
                available: 0,
                requested: amount,
            })?;
        if entry.balance < amount {
            return Err(LedgerError::InsufficientBalance {
                available: entry.balance,
                requested: amount,
            });
        }
        let now = UnixTimestamp::now();
        entry.balance -= amount;
        entry.lifetime_redeemed += amount;
        entry.last_redeemed_at = Some(now);
        entry.updated_at = now;
        Ok(entry.clone())
    }

    pub fn balance(&self, user_id: &UserId, token_id: TokenId) -> Option<LoyaltyBalance> {
        self.balances
            .get(&(user_id.clone(), token_id))
            .map(|b| b.clone())
    }

    /// Holdings of one token across all users, largest first.
    pub fn balances_for_token(&self, token_id: TokenId) -> Vec<LoyaltyBalance> {
        let mut rows: Vec<LoyaltyBalance> = self
            .balances
            .iter()
            .filter(|b| b.token_id == token_id)
            .map(|b| b.clone())
            .collect();
        rows.sort_by(|a, b| b.balance.cmp(&a.balance));
        rows
    }

    /// Appends an immutable audit row for a balance mutation.
    pub fn record_token_tx(
        &self,
        token_id: TokenId,
        user_id: &UserId,
        amount: u64,
        kind: TokenTxKind,
        order_id: Option<OrderId>,
        description: &str,
    ) -> TokenTransaction {
        let tx = TokenTransaction {
            id: TokenTxId::new(),
            token_id,
            user_id: user_id.clone(),
            transaction_hash: TxHash(format!("TX-{}", uuid::Uuid::new_v4())),
            amount,
            kind,
            order_id,
            description: description.to_string(),
            created_at: UnixTimestamp::now(),
        };
        self.token_log
            .write()
            .expect("token log lock poisoned")
            .push(tx.clone());
        tx
    }

    /// Audit rows for one token, oldest first.
    pub fn token_log_for(&self, token_id: TokenId) -> Vec<TokenTransaction> {
        self.token_log
            .read()
            .expect("token log lock poisoned")
            .iter()
            .filter(|t| t.token_id == token_id)
            .cloned()
            .collect()
    }
}
