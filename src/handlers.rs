//! HTTP endpoints for payments, wallets, loyalty tokens, and exchange rates.
//!
//! Handlers stay thin: deserialize, call the orchestrator or token ledger,
//! map domain errors onto status codes. Conflict-class failures (duplicate
//! pending order, duplicate hash, double refund) are `409`; business
//! rejections are `400`; lookups that miss are `404`; a down dependency is
//! `503`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::app::App;
use crate::ledger::LedgerError;
use crate::loyalty::{CreateToken, LoyaltyError};
use crate::orchestrator::{
    ConfirmOutcome, ConfirmPayment, ConnectWallet, InitiatePayment, PaymentError,
};
use crate::rates::RateError;
use crate::types::{Asset, OrderId, PublicKey, TokenId, TxHash, UserId};

pub fn routes() -> Router<Arc<App>> {
    Router::new()
        .route("/payments/initiate", post(initiate_payment))
        .route("/payments/confirm", post(confirm_payment))
        .route("/payments/refund", post(refund_payment))
        .route("/payments/{transaction_hash}", get(get_payment))
        .route("/payments/order/{order_id}/status", get(get_order_status))
        .route("/wallets/connect", post(connect_wallet))
        .route("/wallets/verify", post(connect_wallet))
        .route("/wallets/balance", get(wallet_balance))
        .route("/wallets/transactions", get(wallet_transactions))
        .route("/loyalty/tokens/create", post(create_token))
        .route("/loyalty/tokens/issue", post(issue_tokens))
        .route("/loyalty/tokens/redeem", post(redeem_tokens))
        .route("/loyalty/tokens/holders", get(token_holders))
        .route("/loyalty/tokens/{token_code}", get(get_token))
        .route("/loyalty/balance", get(loyalty_balance))
        .route("/exchange-rates", get(exchange_rates))
        .route("/exchange-rates/calculate", post(calculate_conversion))
        .route("/health", get(health))
}

/// JSON error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<PaymentError> for ApiError {
    fn from(error: PaymentError) -> Self {
        let status = match &error {
            PaymentError::NoPendingTransaction(_)
            | PaymentError::UnknownHash(_)
            | PaymentError::UnknownOrder(_) => StatusCode::NOT_FOUND,
            PaymentError::NotRefundable(_) => StatusCode::CONFLICT,
            PaymentError::InvalidAmount(_)
            | PaymentError::VerificationFailed(_)
            | PaymentError::InvalidSignature => StatusCode::BAD_REQUEST,
            PaymentError::NoReceivingAddress(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PaymentError::VerifierUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::Rate(e) => return rate_status(e),
            PaymentError::Ledger(e) => return ledger_status(e),
        };
        ApiError::new(status, error.to_string())
    }
}

impl From<LoyaltyError> for ApiError {
    fn from(error: LoyaltyError) -> Self {
        let status = match &error {
            LoyaltyError::WalletNotVerified(_)
            | LoyaltyError::SupplyExhausted
            | LoyaltyError::TokenInactive
            | LoyaltyError::ZeroAmount => StatusCode::BAD_REQUEST,
            LoyaltyError::Ledger(e) => return ledger_status(e),
        };
        ApiError::new(status, error.to_string())
    }
}

impl From<RateError> for ApiError {
    fn from(error: RateError) -> Self {
        rate_status(&error)
    }
}

fn ledger_status(error: &LedgerError) -> ApiError {
    let status = match error {
        LedgerError::DuplicatePendingOrder(_)
        | LedgerError::DuplicateHash(_)
        | LedgerError::TokenCodeExists(_) => StatusCode::CONFLICT,
        LedgerError::TransactionNotFound(_) | LedgerError::TokenNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        LedgerError::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
    };
    ApiError::new(status, error.to_string())
}

/// Single mapping for rate errors, whether raised directly by the rate
/// endpoints or surfaced through a payment operation.
fn rate_status(error: &RateError) -> ApiError {
    let status = match error {
        RateError::UnsupportedPair { .. } => StatusCode::BAD_REQUEST,
        RateError::FeedUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    ApiError::new(status, error.to_string())
}

#[instrument(skip_all)]
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `POST /payments/initiate`: converts a USD order total into the requested
/// asset and opens a `PENDING` ledger row.
#[instrument(skip_all)]
async fn initiate_payment(
    State(app): State<Arc<App>>,
    Json(body): Json<InitiatePayment>,
) -> Result<Response, ApiError> {
    let initiated = app.orchestrator.initiate_payment(body).await?;
    Ok((StatusCode::CREATED, Json(initiated)).into_response())
}

/// `POST /payments/confirm`: verifies a submitted hash and settles the
/// pending row. Retries on an already-settled row report the existing row.
#[instrument(skip_all)]
async fn confirm_payment(
    State(app): State<Arc<App>>,
    Json(body): Json<ConfirmPayment>,
) -> Result<Response, ApiError> {
    let outcome = app.orchestrator.confirm_payment(body).await?;
    let transaction = match &outcome {
        ConfirmOutcome::Confirmed(tx) | ConfirmOutcome::AlreadyTerminal(tx) => tx.clone(),
    };
    Ok(Json(transaction).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundRequest {
    transaction_hash: TxHash,
}

/// `POST /payments/refund`: settles a reverse transfer for a confirmed
/// payment. Refunding the same payment twice conflicts.
#[instrument(skip_all)]
async fn refund_payment(
    State(app): State<Arc<App>>,
    Json(body): Json<RefundRequest>,
) -> Result<Response, ApiError> {
    let refund = app.orchestrator.process_refund(body.transaction_hash).await?;
    Ok((StatusCode::CREATED, Json(refund)).into_response())
}

/// `GET /payments/{transaction_hash}`: looks up a ledger row by network hash.
#[instrument(skip_all)]
async fn get_payment(
    State(app): State<Arc<App>>,
    Path(transaction_hash): Path<TxHash>,
) -> Result<Response, ApiError> {
    let tx = app
        .orchestrator
        .transaction_by_hash(&transaction_hash)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("Transaction not found: {transaction_hash}"),
            )
        })?;
    Ok(Json(tx).into_response())
}

/// `GET /payments/order/{order_id}/status`: latest ledger row for an order.
#[instrument(skip_all)]
async fn get_order_status(
    State(app): State<Arc<App>>,
    Path(order_id): Path<OrderId>,
) -> Result<Response, ApiError> {
    let tx = app.store.latest_for_order(&order_id).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No transactions for order {order_id}"),
        )
    })?;
    Ok(Json(tx).into_response())
}

/// `POST /wallets/connect` (alias `POST /wallets/verify`): verifies wallet
/// ownership and registers the wallet.
#[instrument(skip_all)]
async fn connect_wallet(
    State(app): State<Arc<App>>,
    Json(body): Json<ConnectWallet>,
) -> Result<Response, ApiError> {
    let wallet = app.orchestrator.connect_wallet(body)?;
    Ok((StatusCode::CREATED, Json(wallet)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletQuery {
    public_key: PublicKey,
    limit: Option<usize>,
}

/// `GET /wallets/balance?publicKey=`: account balances for an address.
#[instrument(skip_all)]
async fn wallet_balance(
    State(app): State<Arc<App>>,
    Query(query): Query<WalletQuery>,
) -> Result<Response, ApiError> {
    let balances = app.orchestrator.wallet_balances(&query.public_key);
    Ok(Json(balances).into_response())
}

/// `GET /wallets/transactions?publicKey=&limit=`: ledger rows touching an
/// address, newest first.
#[instrument(skip_all)]
async fn wallet_transactions(
    State(app): State<Arc<App>>,
    Query(query): Query<WalletQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(10);
    let transactions = app
        .orchestrator
        .wallet_transactions(&query.public_key, limit);
    Ok(Json(transactions).into_response())
}

/// `POST /loyalty/tokens/create`: creates a restaurant loyalty token. The
/// issuer account defaults to the configured issuing wallet when the body
/// omits `issuerAddress`.
#[instrument(skip_all)]
async fn create_token(
    State(app): State<Arc<App>>,
    Json(body): Json<CreateToken>,
) -> Result<Response, ApiError> {
    let token = app.loyalty.create_token(body)?;
    Ok((StatusCode::CREATED, Json(token)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest {
    user_id: UserId,
    token_id: TokenId,
    amount: u64,
    description: Option<String>,
    order_id: Option<OrderId>,
}

/// `POST /loyalty/tokens/issue`: manually credits tokens to a user with a
/// verified wallet.
#[instrument(skip_all)]
async fn issue_tokens(
    State(app): State<Arc<App>>,
    Json(body): Json<IssueRequest>,
) -> Result<Response, ApiError> {
    let description = body.description.unwrap_or_else(|| "Tokens issued".to_string());
    let record = app.loyalty.issue_tokens(
        &body.user_id,
        body.token_id,
        body.amount,
        &description,
        body.order_id,
    )?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedeemRequest {
    user_id: UserId,
    token_id: TokenId,
    amount: u64,
}

/// `POST /loyalty/tokens/redeem`: debits tokens from a user's balance and
/// returns them to supply.
#[instrument(skip_all)]
async fn redeem_tokens(
    State(app): State<Arc<App>>,
    Json(body): Json<RedeemRequest>,
) -> Result<Response, ApiError> {
    let record = app
        .loyalty
        .redeem_tokens(&body.user_id, body.token_id, body.amount)?;
    Ok(Json(record).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HoldersQuery {
    token_id: TokenId,
}

/// `GET /loyalty/tokens/holders?tokenId=`: holders of a token, largest
/// balance first.
#[instrument(skip_all)]
async fn token_holders(
    State(app): State<Arc<App>>,
    Query(query): Query<HoldersQuery>,
) -> Result<Response, ApiError> {
    let holders = app.loyalty.token_holders(query.token_id)?;
    Ok(Json(holders).into_response())
}

/// `GET /loyalty/tokens/{token_code}`: active-token lookup by code.
#[instrument(skip_all)]
async fn get_token(
    State(app): State<Arc<App>>,
    Path(token_code): Path<String>,
) -> Result<Response, ApiError> {
    let token = app.loyalty.token_info(&token_code).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Token not found: {token_code}"),
        )
    })?;
    Ok(Json(token).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceQuery {
    user_id: UserId,
    token_id: TokenId,
}

/// `GET /loyalty/balance?userId=&tokenId=`: one user's balance row.
#[instrument(skip_all)]
async fn loyalty_balance(
    State(app): State<Arc<App>>,
    Query(query): Query<BalanceQuery>,
) -> Result<Response, ApiError> {
    let balance = app
        .store
        .balance(&query.user_id, query.token_id)
        .unwrap_or_else(|| {
            crate::types::LoyaltyBalance::empty(query.user_id.clone(), query.token_id)
        });
    Ok(Json(balance).into_response())
}

/// `GET /exchange-rates`: current cached rates.
#[instrument(skip_all)]
async fn exchange_rates(State(app): State<Arc<App>>) -> Result<Response, ApiError> {
    let rates = app.rates.rates().await?;
    Ok(Json(rates).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculateRequest {
    from: Asset,
    to: Asset,
    amount: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CalculateResponse {
    from: Asset,
    to: Asset,
    amount: Decimal,
    converted: Decimal,
}

/// `POST /exchange-rates/calculate`: converts an amount between supported
/// assets at current rates.
#[instrument(skip_all)]
async fn calculate_conversion(
    State(app): State<Arc<App>>,
    Json(body): Json<CalculateRequest>,
) -> Result<Response, ApiError> {
    let converted = app.rates.convert(body.from, body.to, body.amount).await?;
    Ok(Json(CalculateResponse {
        from: body.from,
        to: body.to,
        amount: body.amount,
        converted,
    })
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_errors_map_to_409() {
        let api: ApiError =
            PaymentError::Ledger(LedgerError::DuplicatePendingOrder(OrderId::from("o1"))).into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        let api: ApiError = PaymentError::NotRefundable(
            crate::types::TransactionStatus::Pending,
        )
        .into();
        assert_eq!(api.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_business_rejections_map_to_400() {
        let api: ApiError = LoyaltyError::SupplyExhausted.into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        let api: ApiError = PaymentError::VerificationFailed("bad".into()).into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        let api: ApiError = LoyaltyError::Ledger(LedgerError::InsufficientBalance {
            available: 1,
            requested: 2,
        })
        .into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unavailable_dependencies_map_to_503() {
        let api: ApiError = PaymentError::VerifierUnavailable("down".into()).into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        let api: ApiError = RateError::FeedUnavailable("down".into()).into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rate_errors_map_the_same_direct_or_through_payment() {
        let direct: ApiError = RateError::FeedUnavailable("down".into()).into();
        let wrapped: ApiError = PaymentError::Rate(RateError::FeedUnavailable("down".into())).into();
        assert_eq!(direct.status, wrapped.status);
        assert_eq!(direct.message, wrapped.message);

        let direct: ApiError = RateError::UnsupportedPair {
            from: Asset::Xlm,
            to: Asset::Usdc,
        }
        .into();
        let wrapped: ApiError = PaymentError::Rate(RateError::UnsupportedPair {
            from: Asset::Xlm,
            to: Asset::Usdc,
        })
        .into();
        assert_eq!(direct.status, StatusCode::BAD_REQUEST);
        assert_eq!(direct.status, wrapped.status);
        assert_eq!(direct.message, wrapped.message);
    }
}
