//! Commit writer (C8).
//!
//! Sends the `commitAggregate` transaction announcing a sealed
//! aggregate's piece commitment and member offer ids back to the source
//! chain's OnRamp contract, and waits for it to be mined. Mirrors
//! `examples/original_source/xchain.go`'s `commitAggregate` call through
//! `bind.TransactOpts`, adapted onto `alloy-contract`'s typed call
//! builder.

use std::time::Duration;

use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, U256};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;

use crate::error::{AggregatorError, Result};
use crate::onramp::IOnRamp;
use crate::packing::CommitBatch;

pub struct CommitWriter {
    rpc_url: String,
    on_ramp: Address,
    payout_addr: Address,
    signer: PrivateKeySigner,
}

impl CommitWriter {
    pub fn new(rpc_url: impl Into<String>, on_ramp: Address, payout_addr: Address, signer: PrivateKeySigner) -> Self {
        Self { rpc_url: rpc_url.into(), on_ramp, payout_addr, signer }
    }

    /// Submits `commitAggregate(aggCommP, offerIds, subtreeProofs,
    /// payoutAddr)` and waits for the transaction to be included. On
    /// failure to send or to confirm, returns
    /// [`AggregatorError::OnChainTxFailure`] — this never aborts the
    /// process, per spec.md §7.
    pub async fn commit(&self, batch: &CommitBatch, confirm_timeout: Duration) -> Result<()> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect(&self.rpc_url)
            .await
            .map_err(|e| AggregatorError::OnChainTxFailure(format!("connect: {e}")))?;

        let agg_cid = batch.aggregate.piece_cid();
        let call = IOnRamp::commitAggregateCall {
            aggCommP: agg_cid.to_bytes().into(),
            offerIds: batch.offer_ids.clone(),
            subtreeProofs: batch.subtree_proofs.iter().map(|p| p.clone().into()).collect(),
            payoutAddr: self.payout_addr,
        };

        let tx = TransactionRequest::default()
            .with_to(self.on_ramp)
            .with_call(&call);

        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|e| AggregatorError::OnChainTxFailure(format!("send: {e}")))?;

        tokio::time::timeout(confirm_timeout, pending.get_receipt())
            .await
            .map_err(|_| AggregatorError::OnChainTxFailure("confirmation timed out".to_string()))?
            .map_err(|e| AggregatorError::OnChainTxFailure(format!("receipt: {e}")))?;

        tracing::info!(
            offer_ids = ?batch.offer_ids,
            agg_size = batch.aggregate.target(),
            "committed aggregate on-chain"
        );
        Ok(())
    }
}

/// Does not require a provider; used by tests and by the dispatcher to
/// precompute the amount owed before building the transaction, mirroring
/// the original's running total of offer amounts.
pub fn total_payout(batch: &CommitBatch) -> U256 {
    batch.offers.iter().fold(U256::ZERO, |acc, o| acc + o.amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::Offer;
    use alloy_primitives::Address as Addr;

    fn offer(amount: u64) -> Offer {
        Offer {
            comm_p: vec![],
            size: 0,
            cid: String::new(),
            location: String::new(),
            amount: U256::from(amount),
            token: Addr::ZERO,
        }
    }

    #[test]
    fn total_payout_sums_offer_amounts() {
        let batch = CommitBatch {
            aggregate: crate::podsi::Aggregate::new(1 << 20, &[crate::podsi::prefix_piece()]).unwrap(),
            offer_ids: vec![1, 2],
            offers: vec![offer(10), offer(20)],
            subtree_proofs: vec![],
        };
        assert_eq!(total_payout(&batch), U256::from(30));
    }
}
