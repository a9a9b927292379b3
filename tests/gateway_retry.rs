//! Gateway retry and duplicate-protection behavior against a mocked venue.

use grid_hedger::config::{ApiCredentials, ExecutionConfig};
use grid_hedger::exchange::{
    FillRecord, NewOrder, OrderSide, OrderStatus, OrderType, Venue, VenueClient,
};
use grid_hedger::execution::{
    DupeCache, ExecutionError, ExecutionGateway, GatewayEvent, OrderAction, SubmitOutcome,
};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ack_body(client_order_id: &str) -> serde_json::Value {
    json!({
        "orderId": 4321,
        "symbol": "BTCUSDT",
        "status": "FILLED",
        "clientOrderId": client_order_id,
        "price": "0",
        "avgPrice": "100.5",
        "origQty": "1",
        "executedQty": "1",
        "side": "BUY",
        "updateTime": 1_700_000_000_000i64
    })
}

fn fill(client_order_id: &str) -> FillRecord {
    FillRecord {
        order_id: 4321,
        client_order_id: client_order_id.to_string(),
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        price: dec!(100.5),
        executed_qty: dec!(1),
        status: OrderStatus::Filled,
        transact_time: 1_700_000_000_000,
    }
}

fn new_order(client_order_id: &str) -> OrderAction {
    OrderAction::Create(NewOrder {
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        quantity: Some(dec!(1)),
        price: None,
        time_in_force: None,
        reduce_only: None,
        new_client_order_id: Some(client_order_id.to_string()),
    })
}

fn gateway(server_uri: &str, cache: Arc<DupeCache>, max_retries: u32) -> ExecutionGateway {
    let client = VenueClient::new(
        Venue::BinanceFutures,
        &ApiCredentials {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
        },
        Duration::from_secs(5),
        50, // short receive window keeps the settle sleeps fast in tests
    )
    .unwrap()
    .with_base_url(server_uri);

    ExecutionGateway::new(
        Arc::new(client),
        cache,
        &ExecutionConfig {
            max_retries,
            recv_window_ms: 50,
            request_timeout_secs: 5,
        },
    )
}

#[tokio::test]
async fn success_clears_matching_cache_entry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ack_body("v1:3")))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(DupeCache::new(10));
    cache.insert("v1:3", fill("v1:3"));

    let gateway = gateway(&server.uri(), Arc::clone(&cache), 5);
    let outcome = gateway.submit(new_order("v1:3")).await.unwrap();

    assert!(matches!(outcome, SubmitOutcome::Placed(ack) if ack.order_id == 4321));
    assert!(cache.get("v1:3").is_none());
}

#[tokio::test]
async fn out_of_band_fill_stops_retries_after_first_failure() {
    // Attempt 1 fails at the network level; the fill is already known through
    // the duplicate cache, so no second HTTP attempt may be issued.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(DupeCache::new(10));
    cache.insert("v1:7", fill("v1:7"));

    let gateway = gateway(&server.uri(), Arc::clone(&cache), 5);
    let outcome = gateway.submit(new_order("v1:7")).await.unwrap();

    match outcome {
        SubmitOutcome::AlreadyExecuted(fill) => {
            assert_eq!(fill.client_order_id, "v1:7");
            assert_eq!(fill.price, dec!(100.5));
        }
        other => panic!("expected AlreadyExecuted, got {:?}", other),
    }
    // Treated as success: the cache entry is consumed.
    assert!(cache.get("v1:7").is_none());
}

#[tokio::test]
async fn venue_rejection_is_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": -1022,
            "msg": "Signature for this request is not valid."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(&server.uri(), Arc::new(DupeCache::new(10)), 5);
    let err = gateway.submit(new_order("v1:9")).await.unwrap_err();

    match err {
        ExecutionError::Rejected { code, action, .. } => {
            assert_eq!(code, -1022);
            // The terminal error carries the original request parameters.
            assert_eq!(action.client_order_id(), Some("v1:9"));
        }
        other => panic!("expected Rejected, got {}", other),
    }
}

#[tokio::test]
async fn exhausted_retries_carry_request_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(2)
        .mount(&server)
        .await;

    let gateway = gateway(&server.uri(), Arc::new(DupeCache::new(10)), 2);
    let err = gateway.submit(new_order("v1:11")).await.unwrap_err();

    match err {
        ExecutionError::RetriesExhausted { attempts, action, .. } => {
            assert_eq!(attempts, 2);
            assert_eq!(action.symbol(), "BTCUSDT");
        }
        other => panic!("expected RetriesExhausted, got {}", other),
    }
}

#[tokio::test]
async fn terminal_outcomes_are_published_as_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ack_body("v1:13")))
        .mount(&server)
        .await;

    let gateway = gateway(&server.uri(), Arc::new(DupeCache::new(10)), 5);
    let mut events = gateway.subscribe();

    gateway.submit(new_order("v1:13")).await.unwrap();

    match events.try_recv().unwrap() {
        GatewayEvent::Success {
            symbol,
            client_order_id,
            already_executed,
        } => {
            assert_eq!(symbol, "BTCUSDT");
            assert_eq!(client_order_id.as_deref(), Some("v1:13"));
            assert!(!already_executed);
        }
        other => panic!("expected Success event, got {:?}", other),
    }
}
