//! Typed bindings for the OnRamp contract.
//!
//! `examples/original_source/xchain.go` loads the ABI at runtime via
//! `abi.JSON` + `bind.NewBoundContract`. The corpus's EVM-client examples
//! (`other_examples/.../src-chain-evm.rs`) instead generate typed
//! bindings at compile time with `alloy_sol_types::sol!`, which is the
//! idiomatic Rust equivalent and what this module uses.

use alloy_sol_types::sol;

sol! {
    #[derive(Debug)]
    event DataReady(
        uint64 indexed offerId,
        bytes commP,
        uint64 size,
        string cid,
        string location,
        uint256 amount,
        address token
    );

    #[derive(Debug)]
    interface IOnRamp {
        function offerData(bytes calldata commP, uint64 size, string calldata cid, string calldata location, uint256 amount, address token) external returns (uint64);
        function commitAggregate(bytes calldata aggCommP, uint64[] calldata offerIds, bytes[] calldata subtreeProofs, address payoutAddr) external;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    #[test]
    fn data_ready_event_constructs() {
        let ev = DataReady {
            offerId: 1,
            commP: vec![0u8; 32].into(),
            size: 1 << 19,
            cid: "bafy".to_string(),
            location: "http://example.invalid".to_string(),
            amount: U256::from(100u64),
            token: Address::ZERO,
        };
        assert_eq!(ev.offerId, 1);
    }
}
