//! Aggregator runtime (C9).
//!
//! Wires the event subscriber, packing engine, transfer server, and deal
//! dispatcher into one cooperatively-shut-down process. Orchestration
//! shape is grounded in `forest`'s `daemon.rs` (spawn a `JoinSet` of
//! workers, wait for shutdown, cancel and join), adapted from its
//! `async-std` task spawning onto `tokio` + `tokio_util`'s
//! `CancellationToken`, which is what this crate's dependency stack
//! actually carries.

use std::time::Duration;

use alloy_primitives::Address;
use libp2p::multiaddr::Multiaddr;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::buffer::{router as buffer_router, BufferState};
use crate::commit::CommitWriter;
use crate::config::Config;
use crate::deal::{
    build_proposal, build_transfer, propose_deal, sign_proposal, DealRequest, DEAL_STATE_ACCEPTED,
    EAM_ACTOR_NAMESPACE,
};
use crate::deal::derive_f4_address;
use crate::error::{AggregatorError, Result};
use crate::keystore;
use crate::lotus::{collateral_with_margin, resolve_peer, LotusClient};
use crate::offer::DataReadyEvent;
use crate::packing::{PackOutcome, Packer};
use crate::subscriber::Subscriber;
use crate::transfer::{router as transfer_router, unpadded_content_length, Transfer, TransferState};

/// Bounded channel capacity between the event subscriber and the packing
/// engine, per spec.md §5 — a slow packer applies backpressure to log
/// ingestion rather than buffering unboundedly.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct Aggregator {
    config: Config,
    source_chain: String,
}

impl Aggregator {
    pub fn new(config: Config, source_chain: String) -> Self {
        Self { config, source_chain }
    }

    /// Runs every worker until `cancel` fires (or one exits with a fatal
    /// error), then cancels and joins the rest.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let source = self.config.source(&self.source_chain)?.clone();
        let on_ramp: Address = source
            .on_ramp_address
            .parse()
            .map_err(|e| AggregatorError::Config(format!("invalid on_ramp_address: {e}")))?;

        let passphrase = Config::passphrase()?;
        let unlocked = keystore::unlock(&self.config.key_path, &passphrase)?;
        let signer = alloy_signer_local::PrivateKeySigner::from_slice(&unlocked.0)
            .map_err(|e| AggregatorError::Config(format!("invalid signing key: {e}")))?;
        let payout_addr: Address = self
            .config
            .payout_addr
            .parse()
            .map_err(|e| AggregatorError::Config(format!("invalid payout_addr: {e}")))?;

        let transfer_state = TransferState::new();
        let buffer_state = BufferState::new(self.config.buffer_path.clone())?;

        let (tx, rx) = mpsc::channel::<DataReadyEvent>(EVENT_CHANNEL_CAPACITY);

        let mut workers = JoinSet::new();

        workers.spawn({
            let cancel = cancel.clone();
            let addr = format!("{}:{}", self.config.transfer_ip, self.config.transfer_port);
            let state = transfer_state.clone();
            async move { serve(addr, transfer_router(state), cancel).await }
        });

        workers.spawn({
            let cancel = cancel.clone();
            let addr = format!("0.0.0.0:{}", self.config.buffer_port);
            async move { serve(addr, buffer_router(buffer_state), cancel).await }
        });

        workers.spawn({
            let cancel = cancel.clone();
            let ws_url = source.api.clone();
            async move {
                let mut subscriber = Subscriber::new(ws_url, on_ramp);
                subscriber.run(tx, cancel).await
            }
        });

        workers.spawn({
            let cancel = cancel.clone();
            let target = self.config.target_agg_size;
            let lotus_api = self.config.destination.lotus_api.clone();
            let prover_addr = self.config.destination.prover_addr.clone();
            let provider_addr = self.config.provider_addr.clone();
            let chain_id = self.config.destination.chain_id;
            let rpc_url = source.api.clone();
            let transfer_addr = format!("{}:{}", self.config.transfer_ip, self.config.transfer_port);
            async move {
                run_packer(
                    rx,
                    target,
                    lotus_api,
                    prover_addr,
                    provider_addr,
                    chain_id,
                    rpc_url,
                    transfer_addr,
                    on_ramp,
                    payout_addr,
                    signer,
                    transfer_state,
                    cancel,
                )
                .await
            }
        });

        let mut first_error = None;
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "worker exited with error, shutting down");
                    first_error.get_or_insert(e);
                    cancel.cancel();
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "worker task panicked");
                    cancel.cancel();
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn serve(addr: String, app: axum::Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_packer(
    mut rx: mpsc::Receiver<DataReadyEvent>,
    target: u64,
    lotus_api: String,
    prover_addr: String,
    provider_addr: String,
    chain_id: u64,
    rpc_url: String,
    transfer_addr: String,
    on_ramp: Address,
    payout_addr: Address,
    signer: alloy_signer_local::PrivateKeySigner,
    transfer_state: TransferState,
    cancel: CancellationToken,
) -> Result<()> {
    let mut packer = Packer::new(target)?;
    let lotus = LotusClient::new(&lotus_api, None)?;
    let commit_writer = CommitWriter::new(rpc_url, on_ramp, payout_addr, signer);

    let client_f4 = derive_f4_address(EAM_ACTOR_NAMESPACE, prover_addr.parse().unwrap_or(Address::ZERO));
    let miner_info = lotus.state_miner_info(&provider_addr).await?;
    let (provider_peer, provider_multiaddr) = resolve_peer(&miner_info)?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(batch) = packer.flush()? {
                    dispatch(batch, &lotus, &client_f4, &provider_addr, provider_peer, &provider_multiaddr, chain_id, &transfer_addr, &commit_writer, &transfer_state).await;
                }
                return Ok(());
            }
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { return Ok(()) };
                match packer.offer(event) {
                    Ok(PackOutcome::Queued) => {}
                    Ok(PackOutcome::Committed(batch)) => {
                        dispatch(batch, &lotus, &client_f4, &provider_addr, provider_peer, &provider_multiaddr, chain_id, &transfer_addr, &commit_writer, &transfer_state).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping offer that cannot be packed");
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    batch: crate::packing::CommitBatch,
    lotus: &LotusClient,
    client_f4: &str,
    provider_addr_str: &str,
    provider_peer: PeerId,
    provider_multiaddr: &Multiaddr,
    chain_id: u64,
    transfer_addr: &str,
    commit_writer: &CommitWriter,
    transfer_state: &TransferState,
) {
    let piece_size = batch.aggregate.target();

    // Registered up front so the deal proposal's Transfer record can name
    // the id the provider will fetch from, per spec.md §4.6 step 8.
    let transfer_id = transfer_state.register(Transfer {
        aggregate: batch.aggregate.clone(),
        offers: batch.offers.clone(),
    });

    let outcome = async {
        let head = lotus.chain_head().await?;
        let bounds = lotus.state_deal_provider_collateral_bounds(piece_size, false).await?;
        let collateral = collateral_with_margin(&bounds);

        let proposal = build_proposal(
            &batch.aggregate.piece_cid().to_string(),
            piece_size,
            client_f4,
            provider_addr_str,
            &chain_id.to_string(),
            head.height,
            &collateral,
        );
        let signed = sign_proposal(proposal);
        let transfer = build_transfer(transfer_addr, transfer_id, client_f4, unpadded_content_length(piece_size));
        let request = DealRequest {
            deal: signed,
            deal_data_root: batch.aggregate.piece_cid().to_string(),
            is_offline: false,
            transfer,
            fast_retrieval: true,
        };

        let response = propose_deal(provider_multiaddr.clone(), provider_peer, request, Duration::from_secs(30)).await?;
        if response.state != DEAL_STATE_ACCEPTED {
            return Err(AggregatorError::DealRejected(response.message));
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            if let Err(e) = commit_writer.commit(&batch, Duration::from_secs(120)).await {
                tracing::error!(error = %e, offer_ids = ?batch.offer_ids, "failed to write on-chain commit");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, offer_ids = ?batch.offer_ids, "deal dispatch failed, offers dropped");
            transfer_state.remove(transfer_id);
        }
    }
}
