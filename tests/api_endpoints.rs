//! Integration tests for the tallychain HTTP API
//!
//! A node is built over in-memory storage and a mock peer client, then driven
//! entirely through the router.

use axum_test::TestServer;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tallychain::api::build_api_router;
use tallychain::blockchain::{Blockchain, LedgerState};
use tallychain::config::Config;
use tallychain::network::{HttpPeerClient, MockPeerClient, PeerClient, PushOutcome};
use tallychain::node::Node;
use tallychain::persistence::InMemoryPersistence;

async fn test_node(client: Arc<MockPeerClient>) -> Arc<Node> {
    let mut config = Config::default();
    config.ledger.difficulty = 1;
    config.ledger.genesis_balances =
        BTreeMap::from([("Alice".to_string(), 1000), ("Bob".to_string(), 500)]);
    let node = Node::new(config, Arc::new(InMemoryPersistence::new()), client)
        .await
        .expect("Failed to create node");
    Arc::new(node)
}

async fn server() -> TestServer {
    let node = test_node(Arc::new(MockPeerClient::new())).await;
    TestServer::new(build_api_router(node)).expect("Failed to create test server")
}

#[tokio::test]
async fn test_read_endpoints() {
    let server = server().await;

    let response = server.get("/api/health").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());

    let response = server.get("/api/chain").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["length"], 1);
    assert_eq!(json["chain"][0]["previous_hash"], "0");
    assert_eq!(json["chain"][0]["payload"]["message"]["text"], "Genesis Block");

    let response = server.get("/api/chain/0").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["index"], 0);

    let response = server.get("/api/chain/999").await;
    assert_eq!(response.status_code(), 404);
    let json: Value = response.json();
    assert!(json["error"].is_string());

    let response = server.get("/api/chain/valid").await;
    assert_eq!(response.json::<Value>()["valid"], true);

    let response = server.get("/api/balance/Alice").await;
    let json: Value = response.json();
    assert_eq!(json["balance"], 1000);

    let response = server.get("/api/balance/Nobody").await;
    assert_eq!(response.json::<Value>()["balance"], 0);

    let response = server.get("/api/balances").await;
    let json: Value = response.json();
    assert_eq!(json["Bob"], 500);

    let response = server.get("/api/mempool").await;
    let json: Value = response.json();
    assert_eq!(json["count"], 0);
    assert!(json["transactions"].is_array());

    let response = server.get("/api/stats").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert!(json["total_requests"].is_number());
    assert!(json["uptime_seconds"].is_number());
    assert_eq!(json["node"]["chain_length"], 1);
    assert_eq!(json["node"]["is_mining"], false);
}

#[tokio::test]
async fn test_submit_mine_and_reject() {
    let server = server().await;

    for (sender, receiver, amount) in [("Alice", "Bob", 100), ("Bob", "Alice", 50)] {
        let response = server
            .post("/api/transactions")
            .json(&json!({ "kind": "transfer", "sender": sender, "receiver": receiver, "amount": amount }))
            .await;
        assert_eq!(response.status_code(), 201);
    }

    let response = server.post("/api/mine").await;
    assert_eq!(response.status_code(), 200);
    let block: Value = response.json();
    assert_eq!(block["index"], 1);
    assert_eq!(block["payload"]["transactions"].as_array().unwrap().len(), 2);

    assert_eq!(server.get("/api/balance/Alice").await.json::<Value>()["balance"], 950);
    assert_eq!(server.get("/api/balance/Bob").await.json::<Value>()["balance"], 550);

    server
        .post("/api/transactions")
        .json(&json!({ "kind": "transfer", "sender": "Alice", "receiver": "Bob", "amount": 2000 }))
        .await;
    let response = server.post("/api/mine").await;
    assert_eq!(response.status_code(), 422);
    assert!(response.json::<Value>()["error"].is_string());

    assert_eq!(server.get("/api/balance/Alice").await.json::<Value>()["balance"], 950);
    assert_eq!(server.get("/api/chain").await.json::<Value>()["length"], 2);
}

#[tokio::test]
async fn test_invalid_transactions_rejected() {
    let server = server().await;

    let response = server
        .post("/api/transactions")
        .json(&json!({ "kind": "deposit", "account": "1", "amount": 0 }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .post("/api/transactions")
        .json(&json!({ "kind": "withdrawal", "account": "1", "amount": 10 }))
        .await;
    assert_eq!(response.status_code(), 422);

    assert_eq!(server.get("/api/mempool").await.json::<Value>()["count"], 0);
}

#[tokio::test]
async fn test_messages() {
    let server = server().await;

    let response = server
        .post("/api/messages")
        .json(&json!({ "author": "ann", "text": "hello" }))
        .await;
    assert_eq!(response.status_code(), 201);
    assert_eq!(response.json::<Value>()["index"], 1);

    let response = server
        .post("/api/messages")
        .json(&json!({ "author": "ann", "text": "" }))
        .await;
    assert_eq!(response.status_code(), 400);

    let messages: Value = server.get("/api/messages").await.json();
    assert_eq!(messages, json!([{ "author": "ann", "text": "hello" }]));
}

#[tokio::test]
async fn test_external_blocks() {
    let origin = test_node(Arc::new(MockPeerClient::new())).await;
    let block = origin.post_message("ann", "from afar").await.unwrap();
    let server = server().await;

    let response = server.post("/api/blocks").json(&block).await;
    assert_eq!(response.status_code(), 200);

    let response = server.post("/api/blocks").json(&block).await;
    assert_eq!(response.status_code(), 409);

    let mut forged = origin.post_message("ann", "second").await.unwrap();
    forged.payload = tallychain::blockchain::Payload::Message(tallychain::blockchain::Message::new(
        "eve", "second",
    ));
    let response = server.post("/api/blocks").json(&forged).await;
    assert_eq!(response.status_code(), 400);

    assert_eq!(server.get("/api/chain").await.json::<Value>()["length"], 2);
}

#[tokio::test]
async fn test_peers_and_consensus() {
    let client = Arc::new(MockPeerClient::new());
    let node = test_node(client.clone()).await;
    let server = TestServer::new(build_api_router(node)).expect("Failed to create test server");

    let response = server.post("/api/peers").json(&json!({ "address": "" })).await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .post("/api/peers")
        .json(&json!({ "address": "http://peer-b:5001/" }))
        .await;
    assert_eq!(response.status_code(), 200);

    let response = server
        .post("/api/peers/join")
        .json(&json!({ "address": "peer-c:5002" }))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        client.registrations(),
        vec![("peer-b:5001".to_string(), "peer-c:5002".to_string())]
    );

    let json: Value = server.get("/api/peers").await.json();
    assert_eq!(json["count"], 2);
    assert_eq!(json["peers"][0]["address"], "peer-b:5001");

    let mut remote = Blockchain::new(
        1,
        LedgerState::from_seed([("Alice".to_string(), 1000), ("Bob".to_string(), 500)]),
    )
    .unwrap();
    let cancel = std::sync::atomic::AtomicBool::new(false);
    remote
        .mine_payload(
            tallychain::blockchain::Payload::Transactions(vec![
                tallychain::transaction::Transaction::transfer("Bob", "Carol", 25),
            ]),
            &cancel,
        )
        .unwrap();
    client.set_chain("peer-b:5001", remote.blocks.clone());
    client.set_offline("peer-c:5002");

    let json: Value = server.post("/api/consensus/resolve").await.json();
    assert_eq!(json["replaced"], true);
    assert_eq!(json["message"], "Chain replaced");
    assert_eq!(server.get("/api/balance/Carol").await.json::<Value>()["balance"], 25);

    let json: Value = server.get("/api/consensus/resolve").await.json();
    assert_eq!(json["replaced"], false);
    assert_eq!(json["message"], "Chain is authoritative");

    let response = server.delete("/api/peers/peer-c:5002").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(server.get("/api/peers").await.json::<Value>()["count"], 1);

    let response = server.delete("/api/peers/peer-c:5002").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_http_push_of_known_block_is_not_a_failure() {
    let node = test_node(Arc::new(MockPeerClient::new())).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { axum::serve(listener, build_api_router(node)).await });

    let origin = test_node(Arc::new(MockPeerClient::new())).await;
    let block = origin.post_message("ann", "over the wire").await.unwrap();

    let client = HttpPeerClient::new(Duration::from_secs(5)).unwrap();
    assert_eq!(client.push_block(&peer, &block).await.unwrap(), PushOutcome::Accepted);
    assert_eq!(client.push_block(&peer, &block).await.unwrap(), PushOutcome::AlreadyKnown);
    assert_eq!(client.fetch_chain(&peer).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancel_without_mining() {
    let server = server().await;
    let json: Value = server.post("/api/mine/cancel").await.json();
    assert_eq!(json["cancelled"], false);
}
