//! Offer & Piece model (C1).
//!
//! Mirrors `Offer`/`(*Offer).Piece()`/`DataReadyEvent` from
//! `examples/original_source/xchain.go`. Equality is by `offer_id`, never
//! by content, per spec.md §4.1.

use alloy_primitives::{Address, U256};
use cid::Cid;

use crate::error::{AggregatorError, Result};

/// Minimum valid padded piece size: 128 bytes (2^7), matching the Fr32
/// padded-piece validity rule referenced in spec.md's glossary.
pub const MIN_PADDED_PIECE_SIZE: u64 = 128;

/// The unit submitted on-chain. Mirrors the Solidity `Offer` struct
/// consumed via the `DataReady` event (spec.md §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Offer {
    pub comm_p: Vec<u8>,
    pub size: u64,
    pub cid: String,
    pub location: String,
    pub amount: U256,
    pub token: Address,
}

/// A piece commitment and its padded size, the normalized form an
/// [`Offer`] converts to for aggregation (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_cid: Cid,
    pub padded_size: u64,
}

impl Offer {
    /// `Piece(offer)`: validates the padded size and decodes `comm_p`
    /// into a CID. Fails with `InvalidOffer` per spec.md §4.1.
    pub fn piece(&self) -> Result<PieceInfo> {
        validate_padded_size(self.size)
            .map_err(|e| AggregatorError::InvalidOffer(format!("offer size {}: {e}", self.size)))?;
        let piece_cid = Cid::try_from(self.comm_p.as_slice())
            .map_err(|e| AggregatorError::InvalidOffer(format!("invalid commP bytes: {e}")))?;
        Ok(PieceInfo {
            piece_cid,
            padded_size: self.size,
        })
    }
}

/// Padded piece size must be a power of two, at least [`MIN_PADDED_PIECE_SIZE`].
pub fn validate_padded_size(size: u64) -> std::result::Result<(), &'static str> {
    if size < MIN_PADDED_PIECE_SIZE {
        return Err("below minimum padded piece size");
    }
    if !size.is_power_of_two() {
        return Err("not a power of two");
    }
    Ok(())
}

/// `(Offer, OfferID)` decoded from an EVM log, per spec.md §3. The
/// `offer_id` is the contract-assigned, monotonically increasing dedup
/// key; two events are equal iff their ids match, regardless of the
/// offer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReadyEvent {
    pub offer: Offer,
    pub offer_id: u64,
}
