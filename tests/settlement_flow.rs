//! End-to-end settlement flow through the HTTP surface: connect a wallet,
//! create a loyalty token, pay an order, earn tokens, redeem some, then
//! refund the payment.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use clap::Parser;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use dinepay::app::App;
use dinepay::config::Config;
use dinepay::directory::{PermissiveWalletAuth, StaticDirectory};
use dinepay::handlers;
use dinepay::rates::FixedPriceFeed;
use dinepay::types::{PublicKey, RestaurantId, UserId};
use dinepay::verifier::HorizonStub;

use rust_decimal_macros::dec;

fn test_router() -> Router {
    let config = Config::try_parse_from([
        "dinepay",
        "--restaurant-wallet-public-key",
        "GRESTAURANT",
        "--restaurant-id",
        "r1",
        "--loyalty-token-issuer-public-key",
        "GISSUER",
    ])
    .unwrap();
    let directory = Arc::new(StaticDirectory::new(
        RestaurantId::from("r1"),
        PublicKey::from("GRESTAURANT"),
        Some(UserId::from("u1")),
    ));
    let app = Arc::new(App::new(
        config,
        Box::new(FixedPriceFeed::new(dec!(0.10), dec!(1.00))),
        Arc::new(HorizonStub),
        Arc::new(PermissiveWalletAuth),
        directory,
    ));
    handlers::routes().with_state(app)
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_full_settlement_and_loyalty_flow() {
    let router = test_router();

    // Connect the payer's wallet.
    let (status, wallet) = send(
        &router,
        Method::POST,
        "/wallets/connect",
        Some(json!({
            "publicKey": "GPAYER",
            "walletType": "FREIGHTER",
            "signature": "sig",
            "challenge": "challenge",
            "userId": "u1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(wallet["isVerified"], json!(true));

    // Create the restaurant's loyalty token: 5 tokens per dollar. No
    // issuerAddress in the body; the configured issuing wallet is stamped.
    let (status, token) = send(
        &router,
        Method::POST,
        "/loyalty/tokens/create",
        Some(json!({
            "restaurantId": "r1",
            "tokenCode": "CHIP",
            "assetCode": "CHIP",
            "totalSupply": 1000,
            "tokensPerDollar": "5",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(token["issuerAddress"], json!("GISSUER"));
    let token_id = token["id"].as_str().unwrap().to_string();

    // Initiate a 10 USD payment in XLM at 0.10 USD/XLM.
    let (status, initiated) = send(
        &router,
        Method::POST,
        "/payments/initiate",
        Some(json!({
            "orderId": "order-1",
            "asset": "XLM",
            "amount": "10.00",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(initiated["amount"], json!("100"));
    assert_eq!(initiated["destination"], json!("GRESTAURANT"));
    assert_eq!(initiated["memo"], json!("ORDER-order-1"));

    // A second initiation for the same order conflicts.
    let (status, _) = send(
        &router,
        Method::POST,
        "/payments/initiate",
        Some(json!({
            "orderId": "order-1",
            "asset": "XLM",
            "amount": "10.00",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Confirm with the submitted network hash.
    let confirm_body = json!({
        "orderId": "order-1",
        "transactionHash": "abc123hash",
    });
    let (status, confirmed) = send(
        &router,
        Method::POST,
        "/payments/confirm",
        Some(confirm_body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], json!("CONFIRMED"));
    assert_eq!(confirmed["transactionHash"], json!("abc123hash"));

    // Confirming again is benign and reports the settled row.
    let (status, again) = send(&router, Method::POST, "/payments/confirm", Some(confirm_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], confirmed["id"]);

    // The payment earned floor(10.00 * 5) = 50 tokens, exactly once.
    let (status, balance) = send(
        &router,
        Method::GET,
        &format!("/loyalty/balance?userId=u1&tokenId={token_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance["balance"], json!(50));
    assert_eq!(balance["lifetimeEarned"], json!(50));

    // Redeem 20; they return to supply.
    let (status, _) = send(
        &router,
        Method::POST,
        "/loyalty/tokens/redeem",
        Some(json!({
            "userId": "u1",
            "tokenId": token_id,
            "amount": 20,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, token) = send(&router, Method::GET, "/loyalty/tokens/CHIP", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(token["circulatingSupply"], json!(30));

    // The single holder owns 100% of circulating supply.
    let (status, holders) = send(
        &router,
        Method::GET,
        &format!("/loyalty/tokens/holders?tokenId={token_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(holders[0]["userId"], json!("u1"));
    assert_eq!(holders[0]["balance"], json!(30));
    assert_eq!(holders[0]["percentage"], json!("100.00"));

    // Refund the payment: a reverse transfer, settled immediately.
    let (status, refund) = send(
        &router,
        Method::POST,
        "/payments/refund",
        Some(json!({ "transactionHash": "abc123hash" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(refund["transactionType"], json!("REFUND"));
    assert_eq!(refund["status"], json!("CONFIRMED"));
    assert_eq!(refund["fromAddress"], json!("GRESTAURANT"));
    assert_eq!(refund["memo"], json!("REFUND-ORDER-order-1"));

    // Refunding twice conflicts.
    let (status, _) = send(
        &router,
        Method::POST,
        "/payments/refund",
        Some(json!({ "transactionHash": "abc123hash" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The refund row is visible by its derived hash.
    let (status, row) = send(&router, Method::GET, "/payments/REFUND-abc123hash", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["id"], refund["id"]);
}

#[tokio::test]
async fn test_wallet_verify_alias_registers_wallet() {
    let router = test_router();
    let (status, wallet) = send(
        &router,
        Method::POST,
        "/wallets/verify",
        Some(json!({
            "publicKey": "GPAYER",
            "walletType": "FREIGHTER",
            "signature": "sig",
            "challenge": "challenge",
            "userId": "u1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(wallet["publicKey"], json!("GPAYER"));
    assert_eq!(wallet["isVerified"], json!(true));
}

#[tokio::test]
async fn test_exchange_rate_endpoints() {
    let router = test_router();

    let (status, rates) = send(&router, Method::GET, "/exchange-rates", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rates["xlmToUsd"], json!("0.10"));
    assert_eq!(rates["usdcToUsd"], json!("1.00"));

    let (status, result) = send(
        &router,
        Method::POST,
        "/exchange-rates/calculate",
        Some(json!({ "from": "USDC", "to": "XLM", "amount": "10" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["converted"], json!("100"));
}

#[tokio::test]
async fn test_unknown_lookups_return_404() {
    let router = test_router();
    let (status, body) = send(&router, Method::GET, "/payments/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = send(&router, Method::GET, "/loyalty/tokens/NOPE", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
