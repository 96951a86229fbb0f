//! Domain types for the payment settlement and loyalty-token ledger.
//!
//! The four persistent entities ([`PaymentTransaction`], [`Wallet`],
//! [`LoyaltyToken`], [`LoyaltyBalance`]) plus the append-only
//! [`TokenTransaction`] audit row, together with the id newtypes and enums
//! they are built from. Wire representation is camelCase JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::timestamp::UnixTimestamp;

macro_rules! string_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }
    };
}

macro_rules! uuid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_newtype!(
    /// System-generated identity of a [`PaymentTransaction`].
    TransactionId
);
uuid_newtype!(
    /// System-generated identity of a [`LoyaltyToken`].
    TokenId
);
uuid_newtype!(
    /// System-generated identity of a [`TokenTransaction`] audit row.
    TokenTxId
);
uuid_newtype!(
    /// System-generated identity of a [`Wallet`] row.
    WalletId
);

string_newtype!(
    /// Order identifier supplied by the ordering subsystem.
    OrderId
);
string_newtype!(
    /// User identity supplied by the caller (authentication is external).
    UserId
);
string_newtype!(
    /// Restaurant identifier supplied by the restaurant subsystem.
    RestaurantId
);
string_newtype!(
    /// A Stellar network transaction hash. Unique once set on a ledger row.
    TxHash
);
string_newtype!(
    /// A Stellar account public key (`G...`).
    PublicKey
);

impl OrderId {
    /// Prefix used when deriving a payment memo (`ORDER-<prefix>`): the
    /// first 8 characters of the order id. Order ids are not guaranteed to
    /// be ASCII, so the cut is on a char boundary.
    pub fn memo_prefix(&self) -> &str {
        self.0
            .char_indices()
            .nth(8)
            .map_or(self.0.as_str(), |(i, _)| &self.0[..i])
    }
}

/// A tradable unit with a USD exchange rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    #[serde(rename = "XLM")]
    Xlm,
    #[serde(rename = "USDC")]
    Usdc,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Xlm => "XLM",
            Asset::Usdc => "USDC",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "XLM" => Ok(Asset::Xlm),
            "USDC" => Ok(Asset::Usdc),
            other => Err(format!("unknown asset: {other}")),
        }
    }
}

/// Lifecycle state of a [`PaymentTransaction`]. Terminal once `Confirmed` or
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Confirmed => "CONFIRMED",
            TransactionStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Payment,
    TokenIssuance,
    Refund,
}

/// Wallet extensions supported for connecting a Stellar account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletType {
    Freighter,
    Albedo,
    Lobstr,
}

/// Direction of a loyalty balance mutation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenTxKind {
    Earned,
    Redeemed,
    Transferred,
}

/// A single value transfer attempt against the Stellar network.
///
/// Created `Pending` by the orchestrator, transitioned exactly once to
/// `Confirmed` or `Failed`. A refund is a new row of type
/// [`TransactionType::Refund`], never a mutation of the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub id: TransactionId,
    pub order_id: OrderId,
    /// Network identity; `None` while the payment is awaiting submission.
    pub transaction_hash: Option<TxHash>,
    /// Sender address, stamped from chain facts at confirmation.
    pub from_address: Option<PublicKey>,
    pub to_address: PublicKey,
    pub asset: Asset,
    /// Amount in asset units, 7-decimal precision.
    pub amount: Decimal,
    #[serde(rename = "amountInUSD")]
    pub amount_in_usd: Decimal,
    pub fee: Decimal,
    pub status: TransactionStatus,
    pub block_number: Option<u64>,
    pub ledger_sequence: Option<u32>,
    pub memo: String,
    pub transaction_type: TransactionType,
    /// Claim flag set by [`claim_for_distribution`]; grants exactly one
    /// worker permission to issue loyalty tokens for this row.
    ///
    /// [`claim_for_distribution`]: crate::ledger::LedgerStore::claim_for_distribution
    #[serde(default, skip_serializing)]
    pub distribution_claimed: bool,
    pub created_at: UnixTimestamp,
    pub confirmed_at: Option<UnixTimestamp>,
    /// Advisory payment window end; enforced by the expiry sweeper for rows
    /// that never received a hash.
    pub expires_at: Option<UnixTimestamp>,
}

/// A user's verified Stellar address. One row per public key; reconnecting
/// the same key updates type and verification instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub public_key: PublicKey,
    pub wallet_type: WalletType,
    pub is_verified: bool,
    pub last_verified_at: Option<UnixTimestamp>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

/// A restaurant's issued loyalty currency.
///
/// Invariant: `0 <= circulating_supply <= total_supply` under all concurrent
/// issuances, enforced by the ledger store's supply primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyToken {
    pub id: TokenId,
    pub restaurant_id: RestaurantId,
    pub token_code: String,
    pub asset_code: String,
    pub issuer_address: PublicKey,
    pub total_supply: u64,
    pub circulating_supply: u64,
    pub tokens_per_dollar: Decimal,
    /// USD value of one token at redemption.
    pub redemption_value: Decimal,
    pub expiration_days: Option<u32>,
    pub is_active: bool,
    pub created_at: UnixTimestamp,
}

impl LoyaltyToken {
    pub fn available_supply(&self) -> u64 {
        self.total_supply - self.circulating_supply
    }
}

/// A user's holding of one loyalty token, unique per (`userId`, `tokenId`).
///
/// Invariant: `balance = lifetime_earned - lifetime_redeemed >= 0`. Created
/// lazily on first issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyBalance {
    pub user_id: UserId,
    pub token_id: TokenId,
    pub balance: u64,
    pub lifetime_earned: u64,
    pub lifetime_redeemed: u64,
    pub last_earned_at: Option<UnixTimestamp>,
    pub last_redeemed_at: Option<UnixTimestamp>,
    pub updated_at: UnixTimestamp,
}

impl LoyaltyBalance {
    pub fn empty(user_id: UserId, token_id: TokenId) -> Self {
        LoyaltyBalance {
            user_id,
            token_id,
            balance: 0,
            lifetime_earned: 0,
            lifetime_redeemed: 0,
            last_earned_at: None,
            last_redeemed_at: None,
            updated_at: UnixTimestamp::now(),
        }
    }
}

/// Append-only audit entry for a loyalty balance mutation. Immutable once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransaction {
    pub id: TokenTxId,
    pub token_id: TokenId,
    pub user_id: UserId,
    /// System-generated idempotency key (`TX-<uuid>`).
    pub transaction_hash: TxHash,
    pub amount: u64,
    #[serde(rename = "type")]
    pub kind: TokenTxKind,
    pub order_id: Option<OrderId>,
    pub description: String,
    pub created_at: UnixTimestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_wire_names() {
        assert_eq!(serde_json::to_string(&Asset::Xlm).unwrap(), "\"XLM\"");
        assert_eq!(serde_json::to_string(&Asset::Usdc).unwrap(), "\"USDC\"");
        let parsed: Asset = serde_json::from_str("\"USDC\"").unwrap();
        assert_eq!(parsed, Asset::Usdc);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Confirmed).unwrap(),
            "\"CONFIRMED\""
        );
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_memo_prefix_truncates_long_order_ids() {
        let order = OrderId::from("0a1b2c3d4e5f");
        assert_eq!(order.memo_prefix(), "0a1b2c3d");
        let short = OrderId::from("o1");
        assert_eq!(short.memo_prefix(), "o1");
    }

    #[test]
    fn test_memo_prefix_cuts_multibyte_order_ids_on_char_boundary() {
        // Eight chars land inside the second byte of an 'ö' when sliced by
        // byte index; the prefix must count characters instead.
        let order = OrderId::from("aöööööööö");
        assert_eq!(order.memo_prefix(), "aööööööö");
        let exact = OrderId::from("éclair-№");
        assert_eq!(exact.memo_prefix(), "éclair-№");
    }

    #[test]
    fn test_token_tx_kind_serializes_as_type_field() {
        let tx = TokenTransaction {
            id: TokenTxId::new(),
            token_id: TokenId::new(),
            user_id: UserId::from("u1"),
            transaction_hash: TxHash::from("TX-abc"),
            amount: 50,
            kind: TokenTxKind::Earned,
            order_id: None,
            description: "Tokens issued for purchase".to_string(),
            created_at: UnixTimestamp::from_secs(0),
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "EARNED");
        assert_eq!(json["transactionHash"], "TX-abc");
    }
}
