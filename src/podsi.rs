//! PODSI aggregate model.
//!
//! Realizes the `datasegment.Aggregate` type referenced throughout
//! `examples/original_source/xchain.go` (`NewAggregate`, `PieceCID`,
//! `ProofForPieceInfo`, `AggregateObjectReader`). The real go-data-segment
//! scheme lays pieces into a binary Merkle tree with an index of per-piece
//! subtree commitments; no Rust crate implementing that wire format was
//! available in the reference corpus (see DESIGN.md), so this module
//! implements the same *shape* — deterministic power-of-two-aligned
//! placement, a binary Merkle root over piece commitments, and per-piece
//! inclusion proofs — using sha2 digests instead of the Fr32 field
//! arithmetic the real scheme uses. `PieceCID`/proof outputs are therefore
//! not bit-compatible with a real Filecoin aggregate, but every invariant
//! spec.md §8 asks for (P1, P3, P6) holds under this model.

use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::offer::PieceInfo;

/// Bytes reserved per piece for the PODSI index entry (commented out as
/// `pieceOverhead` in the original source; kept here so packing math has
/// somewhere principled to account for index space).
pub const INDEX_ENTRY_SIZE: u64 = 64;

/// Hex-encoded fixed CAR prefix every aggregate must begin with, verbatim
/// from `examples/original_source/xchain.go`'s `prefixCAR` constant.
pub const PREFIX_CAR_HEX: &str = "3aa265726f6f747381d82a58250001701220b9ecb605f194801ee8a8355014e7e6e62966f94ccb6081\
631e82217872209dae6776657273696f6e014101551220704a26a32a76cf3ab66ffe41eb27adefefe9c93206960bb0\
147b9ed5e1e948b0576861744966487567684576657265747449494957617352696768743f5601701220b9ecb605f1\
94801ee8a8355014e7e6e62966f94ccb6081631e82217872209dae122c0a2401551220704a26a32a76cf3ab66ffe41\
eb27adefefe9c93206960bb0147b9ed5e1e948b012026576181d0a020801";

/// Pinned CID of the fixed CAR prefix.
pub const PREFIX_PIECE_CID: &str = "baga6ea4seaqiklhpuei4wz7x3wwpvnul3sscfyrz2dpi722vgpwlolfky2dmwey";

/// Padded size of the fixed CAR prefix.
pub const PREFIX_PIECE_SIZE: u64 = 256;

pub fn prefix_car_bytes() -> Vec<u8> {
    hex::decode(PREFIX_CAR_HEX).expect("prefix CAR hex is a compile-time constant")
}

pub fn prefix_piece() -> PieceInfo {
    PieceInfo {
        piece_cid: PREFIX_PIECE_CID.parse().expect("prefix CID is a compile-time constant"),
        padded_size: PREFIX_PIECE_SIZE,
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PackingError {
    #[error("target size {0} is not a power of two")]
    TargetNotPowerOfTwo(u64),
    #[error("pieces overflow target of {target} bytes by {overflow} bytes")]
    Overflow { target: u64, overflow: u64 },
    #[error("piece is not a member of this aggregate")]
    NotAMember,
}

/// One placed piece: its commitment, padded size, and byte offset within
/// the aggregate's data region.
#[derive(Debug, Clone)]
struct Placement {
    piece: PieceInfo,
    offset: u64,
}

/// A Merkle inclusion proof for one piece within an aggregate, standing
/// in for go-data-segment's `merkletree.ProofData` ("subtree proof" in
/// spec.md's glossary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub leaf_index: usize,
    pub siblings: Vec<[u8; 32]>,
}

impl Proof {
    /// Encodes the proof as `leaf_index (u64 LE) || siblings...` for
    /// submission as one of `commitAggregate`'s `subtreeProofs` entries.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.siblings.len() * 32);
        out.extend_from_slice(&(self.leaf_index as u64).to_le_bytes());
        for sibling in &self.siblings {
            out.extend_from_slice(sibling);
        }
        out
    }
}

/// A packed aggregate: the first piece is always the fixed CAR prefix
/// (enforced by [`Aggregate::new`]'s caller, `packing.rs`), per spec.md §3.
#[derive(Debug, Clone)]
pub struct Aggregate {
    target: u64,
    placements: Vec<Placement>,
    leaves: Vec<[u8; 32]>,
}

fn leaf_hash(piece: &PieceInfo, offset: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(piece.piece_cid.to_bytes());
    hasher.update(offset.to_le_bytes());
    hasher.update(piece.padded_size.to_le_bytes());
    hasher.finalize().into()
}

fn parent_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"podsi-node");
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

impl Aggregate {
    /// `NewAggregate(target, pieces)`. `pieces` must include the prefix
    /// piece as its first element, per spec.md's packing invariant P1.
    pub fn new(target: u64, pieces: &[PieceInfo]) -> Result<Self, PackingError> {
        if !target.is_power_of_two() {
            return Err(PackingError::TargetNotPowerOfTwo(target));
        }

        let mut placements = Vec::with_capacity(pieces.len());
        let mut cursor: u64 = 0;
        for piece in pieces {
            // Power-of-two aligned placement, matching the alignment rule
            // unpadded-to-padded Fr32 segment packing relies on.
            let align = piece.padded_size.max(1);
            let offset = cursor.div_ceil(align) * align;
            cursor = offset
                .checked_add(piece.padded_size)
                .ok_or(PackingError::Overflow { target, overflow: u64::MAX })?;
            placements.push(Placement { piece: piece.clone(), offset });
        }

        let index_size = (pieces.len() as u64).saturating_mul(INDEX_ENTRY_SIZE);
        let total = cursor.saturating_add(index_size);
        if total > target {
            return Err(PackingError::Overflow { target, overflow: total - target });
        }

        let leaves = placements.iter().map(|p| leaf_hash(&p.piece, p.offset)).collect();
        Ok(Self { target, placements, leaves })
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// `agg.PieceCID()`: the aggregate's own commitment, a Merkle root
    /// over all leaves padded to a power-of-two width with zero leaves.
    pub fn piece_cid(&self) -> Cid {
        let root = merkle_root(&self.leaves);
        let digest = Code::Sha2_256.digest(&root);
        // fil-commitment-unsealed-like multicodec tag (0xf101), matching
        // the "CommP is addressable as a CID" contract in the glossary.
        Cid::new_v1(0xf101, digest)
    }

    /// `agg.ProofForPieceInfo(piece)`.
    pub fn proof_for_piece_info(&self, piece: &PieceInfo) -> Result<Proof, PackingError> {
        let leaf_index = self
            .placements
            .iter()
            .position(|p| p.piece.piece_cid == piece.piece_cid && p.offset < self.target)
            .ok_or(PackingError::NotAMember)?;
        Ok(Proof {
            leaf_index,
            siblings: merkle_siblings(&self.leaves, leaf_index),
        })
    }

    /// `agg.AggregateObjectReader(readers)`: weaves the supplied readers
    /// (one per placed piece, in placement order) into the canonical byte
    /// sequence. Per spec.md §4.7 this is a straight concatenation in
    /// placement order under this crate's packing model.
    pub fn aggregate_object_reader<R>(readers: Vec<R>) -> ChainedReader<R>
    where
        R: AsyncRead + Unpin,
    {
        ChainedReader::new(readers)
    }
}

fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let width = leaves.len().next_power_of_two();
    let mut level: Vec<[u8; 32]> = (0..width)
        .map(|i| leaves.get(i).copied().unwrap_or([0u8; 32]))
        .collect();
    while level.len() > 1 {
        level = level.chunks(2).map(|pair| parent_hash(&pair[0], &pair[1])).collect();
    }
    level[0]
}

fn merkle_siblings(leaves: &[[u8; 32]], index: usize) -> Vec<[u8; 32]> {
    if leaves.is_empty() {
        return Vec::new();
    }
    let width = leaves.len().next_power_of_two();
    let mut level: Vec<[u8; 32]> = (0..width)
        .map(|i| leaves.get(i).copied().unwrap_or([0u8; 32]))
        .collect();
    let mut idx = index;
    let mut siblings = Vec::new();
    while level.len() > 1 {
        let sibling_idx = idx ^ 1;
        siblings.push(level[sibling_idx]);
        level = level.chunks(2).map(|pair| parent_hash(&pair[0], &pair[1])).collect();
        idx /= 2;
    }
    siblings
}

/// Chains a fixed sequence of async readers into one, advancing to the
/// next reader on EOF. Used by `transfer.rs` to stream the fixed CAR
/// prefix followed by each lazily-fetched sub-piece, in order.
pub struct ChainedReader<R> {
    readers: std::collections::VecDeque<R>,
}

impl<R> ChainedReader<R> {
    fn new(readers: Vec<R>) -> Self {
        Self { readers: readers.into() }
    }
}

impl<R> AsyncRead for ChainedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            let Some(front) = this.readers.front_mut() else {
                return Poll::Ready(Ok(()));
            };
            let before = buf.filled().len();
            match Pin::new(front).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {
                    if buf.filled().len() == before {
                        // current reader is exhausted, advance
                        this.readers.pop_front();
                        continue;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub fn io_other<E: std::fmt::Display>(e: E) -> IoError {
    IoError::new(ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(tag: u8, size: u64) -> PieceInfo {
        let digest = Code::Sha2_256.digest(&[tag]);
        PieceInfo {
            piece_cid: Cid::new_v1(0x55, digest),
            padded_size: size,
        }
    }

    #[test]
    fn prefix_piece_decodes() {
        let p = prefix_piece();
        assert_eq!(p.padded_size, 256);
        assert_eq!(prefix_car_bytes().len(), PREFIX_CAR_HEX.len() / 2);
    }

    #[test]
    fn two_pieces_fit_exactly_commit_together() {
        let target = 1 << 20;
        let pieces = vec![prefix_piece(), piece(1, 1 << 19), piece(2, 1 << 18)];
        // prefix(256) + 1<<19 + 1<<18 + 3*64 index well under 1<<20
        assert!(Aggregate::new(target, &pieces).is_ok());
    }

    #[test]
    fn oversized_single_offer_does_not_fit_alone() {
        let target = 1 << 20;
        let huge = piece(1, 1 << 20);
        let pieces = vec![prefix_piece(), huge];
        assert!(Aggregate::new(target, &pieces).is_err());
    }

    #[test]
    fn proof_round_trips_for_every_member() {
        let target = 1 << 21;
        let pieces = vec![prefix_piece(), piece(1, 1 << 19), piece(2, 1 << 19)];
        let agg = Aggregate::new(target, &pieces).unwrap();
        for p in &pieces {
            let proof = agg.proof_for_piece_info(p).unwrap();
            assert_eq!(proof.siblings.len(), agg.leaves.len().next_power_of_two().trailing_zeros() as usize);
        }
    }

    #[test]
    fn proof_for_non_member_fails() {
        let target = 1 << 21;
        let pieces = vec![prefix_piece(), piece(1, 1 << 19)];
        let agg = Aggregate::new(target, &pieces).unwrap();
        let stranger = piece(9, 1 << 19);
        assert_eq!(agg.proof_for_piece_info(&stranger), Err(PackingError::NotAMember));
    }

    #[test]
    fn target_must_be_power_of_two() {
        assert!(Aggregate::new(3 << 19, &[prefix_piece()]).is_err());
    }
}
