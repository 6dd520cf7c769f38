//! JSON-RPC 2.0 envelopes and the Ethereum payloads the ledger client reads.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainplace_core::client::{parse_hex_u128, parse_hex_u64};
use chainplace_core::{BlockNumber, ChainError, FilterQuery, Header, Log};

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

// ─── Ethereum payloads ───────────────────────────────────────────────────────

/// `eth_getBlockByNumber` result, hydrated = false.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    pub number: String,
    pub timestamp: String,
    #[serde(default)]
    pub base_fee_per_gas: Option<String>,
}

impl TryFrom<RpcHeader> for Header {
    type Error = ChainError;

    fn try_from(h: RpcHeader) -> Result<Self, Self::Error> {
        Ok(Header {
            number: BlockNumber(parse_hex_u64(&h.number)?),
            timestamp: parse_hex_u64(&h.timestamp)?,
            base_fee: h.base_fee_per_gas.as_deref().map(parse_hex_u128).transpose()?,
        })
    }
}

/// `eth_getLogs` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: String,
    pub transaction_hash: B256,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

impl TryFrom<RpcLog> for Log {
    type Error = ChainError;

    fn try_from(l: RpcLog) -> Result<Self, Self::Error> {
        Ok(Log {
            address: l.address,
            topics: l.topics,
            data: l.data,
            block_number: BlockNumber(parse_hex_u64(&l.block_number)?),
            tx_hash: l.transaction_hash,
            log_index: parse_hex_u64(&l.log_index)?,
            removed: l.removed,
        })
    }
}

/// `eth_getLogs` filter object. An empty alternative set becomes `null`.
pub fn filter_params(query: &FilterQuery) -> Value {
    let topics: Vec<Value> = query
        .topics
        .iter()
        .map(|alternatives| match alternatives.len() {
            0 => Value::Null,
            _ => json!(alternatives),
        })
        .collect();

    let mut filter = json!({
        "fromBlock": format!("{:#x}", query.from_block.as_u64()),
        "toBlock": format!("{:#x}", query.to_block.as_u64()),
        "topics": topics,
    });
    if !query.addresses.is_empty() {
        filter["address"] = json!(query.addresses);
    }
    json!([filter])
}
