//! Integration tests for JsonRpcClient.
//!
//! Uses wiremock for the node. Covers quantity parsing, status mapping,
//! broadcast error classification and a full dispatch through the executor.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use serde_json::json;
use stablerail_chain::{
    ChainConfig, ChainError, ChainExecutor, ChainRpc, ChainTable, DispatchOptions,
    JsonRpcClient, PaymentOrder, ReceiptStatus, RetryConfig, SimulatedSigner, WalletRef,
};
use stablerail_mandate::PaymentBody;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> JsonRpcClient {
    JsonRpcClient::new(server.uri(), Duration::from_secs(5)).expect("failed to create client")
}

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": code, "message": message}
    }))
}

async fn mount(server: &MockServer, rpc_method: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": rpc_method})))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_block_number() {
    let server = MockServer::start().await;
    mount(&server, "eth_blockNumber", rpc_result(json!("0x1b4"))).await;
    assert_eq!(client(&server).block_number().await.unwrap(), 436);
}

#[tokio::test]
async fn test_pending_nonce_sends_pending_tag() {
    let server = MockServer::start().await;
    let address: Address = "0x00000000000000000000000000000000000000f1".parse().unwrap();
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "eth_getTransactionCount",
            "params": [address.to_checksum(None), "pending"]
        })))
        .respond_with(rpc_result(json!("0x7")))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(client(&server).pending_nonce(address).await.unwrap(), 7);
}

#[tokio::test]
async fn test_base_fee_from_latest_block() {
    let server = MockServer::start().await;
    mount(
        &server,
        "eth_getBlockByNumber",
        rpc_result(json!({"number": "0x10", "baseFeePerGas": "0x3b9aca00"})),
    )
    .await;
    assert_eq!(client(&server).base_fee().await.unwrap(), 1_000_000_000);
}

#[tokio::test]
async fn test_priority_fee_method_not_found() {
    let server = MockServer::start().await;
    mount(
        &server,
        "eth_maxPriorityFeePerGas",
        rpc_error(-32601, "the method eth_maxPriorityFeePerGas does not exist"),
    )
    .await;
    assert_eq!(client(&server).max_priority_fee().await.unwrap(), None);
}

#[tokio::test]
async fn test_receipt_pending_and_reverted() {
    let server = MockServer::start().await;
    let pending = B256::repeat_byte(0x01);
    let reverted = B256::repeat_byte(0x02);

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "eth_getTransactionReceipt",
            "params": [format!("0x{}", hex::encode(pending))]
        })))
        .respond_with(rpc_result(serde_json::Value::Null))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "eth_getTransactionReceipt",
            "params": [format!("0x{}", hex::encode(reverted))]
        })))
        .respond_with(rpc_result(json!({
            "blockNumber": "0x20",
            "status": "0x0",
            "revertReason": "ERC20: transfer to the zero address"
        })))
        .mount(&server)
        .await;

    let rpc = client(&server);
    assert_eq!(rpc.transaction_receipt(pending).await.unwrap(), None);

    let receipt = rpc.transaction_receipt(reverted).await.unwrap().unwrap();
    assert_eq!(receipt.block_number, 32);
    assert!(!receipt.success);
    assert_eq!(
        receipt.revert_reason.as_deref(),
        Some("ERC20: transfer to the zero address")
    );
}

#[tokio::test]
async fn test_503_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server).block_number().await.unwrap_err();
    assert!(matches!(err, ChainError::RpcUnavailable { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_broadcast_stale_nonce_classified() {
    let server = MockServer::start().await;
    mount(
        &server,
        "eth_sendRawTransaction",
        rpc_error(-32000, "nonce too low"),
    )
    .await;

    let err = client(&server)
        .send_raw_transaction(&Bytes::from_static(&[0x02, 0xc0]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::StaleNonce { .. }));
}

#[tokio::test]
async fn test_broadcast_already_known_classified() {
    let server = MockServer::start().await;
    mount(
        &server,
        "eth_sendRawTransaction",
        rpc_error(-32000, "already known"),
    )
    .await;

    let err = client(&server)
        .send_raw_transaction(&Bytes::from_static(&[0x02, 0xc0]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::AlreadyKnown { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_broadcast_other_rejection() {
    let server = MockServer::start().await;
    mount(
        &server,
        "eth_sendRawTransaction",
        rpc_error(-32000, "insufficient funds for gas * price + value"),
    )
    .await;

    let err = client(&server)
        .send_raw_transaction(&Bytes::from_static(&[0x02, 0xc0]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::BroadcastRejected { .. }));
}

#[tokio::test]
async fn test_dispatch_through_json_rpc() {
    let server = MockServer::start().await;
    mount(
        &server,
        "eth_getBlockByNumber",
        rpc_result(json!({"baseFeePerGas": "0x3b9aca00"})),
    )
    .await;
    mount(&server, "eth_maxPriorityFeePerGas", rpc_result(json!("0x59682f00"))).await;
    mount(&server, "eth_estimateGas", rpc_result(json!("0xcb20"))).await;
    mount(&server, "eth_getTransactionCount", rpc_result(json!("0x0"))).await;
    mount(
        &server,
        "eth_sendRawTransaction",
        rpc_result(json!(format!("0x{}", "ab".repeat(32)))),
    )
    .await;
    mount(&server, "eth_blockNumber", rpc_result(json!("0x64"))).await;
    mount(
        &server,
        "eth_getTransactionReceipt",
        rpc_result(json!({"blockNumber": "0x64", "status": "0x1"})),
    )
    .await;

    let signer = SimulatedSigner::new(b"wiremock");
    let wallet = signer.address_for("hot-base").unwrap();
    let chain = ChainConfig::new(
        8453,
        server.uri(),
        WalletRef::new("hot-base", wallet.to_checksum(None)),
    )
    .with_stablecoin("USDC", "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", 6)
    .with_poll_interval(Duration::from_millis(10));

    let executor = ChainExecutor::new(
        ChainTable::empty().with_chain("base", chain),
        RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        Arc::new(signer),
    )
    .with_rpc("base", Arc::new(client(&server)));

    let order = PaymentOrder::new(
        "pay-1",
        PaymentBody {
            amount_minor: 2500,
            token: "USDC".into(),
            chain: "base".into(),
            destination: "0x00000000000000000000000000000000000000aa".into(),
            audit_hash: None,
        },
    );
    executor
        .dispatch_payment(&order, DispatchOptions::default())
        .await
        .unwrap();
    let done = executor.wait_terminal("pay-1").await.unwrap();
    assert_eq!(done.status, ReceiptStatus::Confirmed);
    assert_eq!(done.block_number, Some(100));
    assert_eq!(done.confirmations, 1);
}
