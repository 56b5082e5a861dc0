//! Lotus JSON-RPC client.
//!
//! Talks to a Filecoin daemon the way `examples/original_source/xchain.go`
//! does through its hand-rolled JSON-RPC helper, but via `jsonrpsee`'s
//! typed HTTP client the way `forest`'s RPC client crate wraps its own
//! API surface.

use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use num_bigint::BigInt;
use serde::Deserialize;

use crate::error::{AggregatorError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct TipSetKey(pub Vec<serde_json::Value>);

#[derive(Debug, Clone, Deserialize)]
pub struct ChainHead {
    #[serde(rename = "Height")]
    pub height: i64,
    #[serde(rename = "Cids")]
    pub cids: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerInfo {
    #[serde(rename = "Owner")]
    pub owner: String,
    #[serde(rename = "Worker")]
    pub worker: String,
    #[serde(rename = "PeerId")]
    pub peer_id: Option<String>,
    #[serde(rename = "Multiaddrs")]
    pub multiaddrs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollateralBounds {
    #[serde(rename = "Min", with = "bigint_str")]
    pub min: BigInt,
    #[serde(rename = "Max", with = "bigint_str")]
    pub max: BigInt,
}

mod bigint_str {
    use num_bigint::BigInt;
    use serde::{de::Error, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigInt, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<BigInt>().map_err(D::Error::custom)
    }
}

pub struct LotusClient {
    client: HttpClient,
}

impl LotusClient {
    pub fn new(api_url: &str, bearer_token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AggregatorError::Config(format!("invalid lotus bearer token: {e}")))?;
            headers.insert("Authorization", value);
        }
        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .build(api_url)
            .map_err(|e| AggregatorError::Config(format!("failed to build lotus client: {e}")))?;
        Ok(Self { client })
    }

    pub async fn chain_head(&self) -> Result<ChainHead> {
        self.client
            .request("Filecoin.ChainHead", rpc_params![])
            .await
            .map_err(|e| AggregatorError::TransportRetryable(format!("ChainHead: {e}")))
    }

    pub async fn state_miner_info(&self, miner: &str) -> Result<MinerInfo> {
        self.client
            .request("Filecoin.StateMinerInfo", rpc_params![miner, Vec::<serde_json::Value>::new()])
            .await
            .map_err(|e| AggregatorError::TransportRetryable(format!("StateMinerInfo: {e}")))
    }

    pub async fn state_deal_provider_collateral_bounds(
        &self,
        padded_size: u64,
        verified: bool,
    ) -> Result<CollateralBounds> {
        self.client
            .request(
                "Filecoin.StateDealProviderCollateralBounds",
                rpc_params![padded_size, verified, Vec::<serde_json::Value>::new()],
            )
            .await
            .map_err(|e| {
                AggregatorError::TransportRetryable(format!("StateDealProviderCollateralBounds: {e}"))
            })
    }
}

/// `bounds.Min * 6 / 5`: the 20% collateral margin applied in
/// `examples/original_source/xchain.go` before proposing a deal.
pub fn collateral_with_margin(bounds: &CollateralBounds) -> BigInt {
    &bounds.min * BigInt::from(6) / BigInt::from(5)
}

/// Resolves a miner's libp2p dialing address from `Filecoin.StateMinerInfo`,
/// per spec.md §6: the configured `provider_addr` names an f-address, not
/// a dialable peer id/multiaddr pair, so this must run before the deal
/// dispatcher can open a connection.
pub fn resolve_peer(info: &MinerInfo) -> Result<(libp2p::PeerId, libp2p::Multiaddr)> {
    let peer_id_str = info
        .peer_id
        .as_deref()
        .ok_or_else(|| AggregatorError::Config("miner has no registered peer id".to_string()))?;
    let peer = peer_id_str
        .parse::<libp2p::PeerId>()
        .map_err(|e| AggregatorError::Config(format!("invalid miner peer id: {e}")))?;
    let addr_str = info
        .multiaddrs
        .first()
        .ok_or_else(|| AggregatorError::Config("miner has no registered multiaddrs".to_string()))?;
    let multiaddr = addr_str
        .parse::<libp2p::Multiaddr>()
        .map_err(|e| AggregatorError::Config(format!("invalid miner multiaddr: {e}")))?;
    Ok((peer, multiaddr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collateral_margin_is_twenty_percent_over_minimum() {
        let bounds = CollateralBounds { min: BigInt::from(1000), max: BigInt::from(10000) };
        assert_eq!(collateral_with_margin(&bounds), BigInt::from(1200));
    }

    #[test]
    fn resolve_peer_requires_peer_id_and_multiaddr() {
        let info = MinerInfo {
            owner: "f01".to_string(),
            worker: "f01".to_string(),
            peer_id: None,
            multiaddrs: vec![],
        };
        assert!(resolve_peer(&info).is_err());
    }

    #[test]
    fn resolve_peer_parses_valid_miner_info() {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let peer = libp2p::PeerId::from(keypair.public());
        let info = MinerInfo {
            owner: "f01".to_string(),
            worker: "f01".to_string(),
            peer_id: Some(peer.to_string()),
            multiaddrs: vec!["/ip4/127.0.0.1/tcp/1234".to_string()],
        };
        let (resolved_peer, resolved_addr) = resolve_peer(&info).unwrap();
        assert_eq!(resolved_peer, peer);
        assert_eq!(resolved_addr.to_string(), "/ip4/127.0.0.1/tcp/1234");
    }
}
