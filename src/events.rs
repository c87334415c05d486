//! The two events the listener consumes, and decoding of raw logs into [`ChainEvent`]s.
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;

/// Solidity declarations of the consumed events. Defined by the deployed contracts; only decoded here.
#[allow(missing_docs)]
pub mod abi {
    alloy::sol! {
        #[derive(Debug)]
        event Transfer(address indexed from, address indexed to, uint256 value);

        #[derive(Debug)]
        event Redeemed(address indexed user, uint256 amount, string indexed ticker);
    }
}

use abi::{Redeemed, Transfer};

/// What kind of entitlement signal a log carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// ERC-20 `Transfer`; only a transfer to the zero address is a burn.
    Transfer {
        /// Destination of the transfer.
        to: Address,
    },
    /// Dedicated `Redeemed` event. The ticker is indexed, so only its hash is on chain.
    Redeemed {
        /// keccak256 of the ticker string.
        ticker_topic: B256,
    },
}

/// A decoded chain event, normalized for the Listener Core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    /// Token contract that emitted the log.
    pub contract: Address,
    /// Event shape.
    pub kind: EventKind,
    /// Originating user (`from` for transfers, `user` for redemptions).
    pub user: Address,
    /// Amount in base units.
    pub amount: U256,
    /// Block the log was included in (0 for pending logs).
    pub block_number: u64,
    /// Transaction hash, when the node reports it.
    pub tx_hash: Option<B256>,
}

/// Topic0 hashes of both consumed events, for log filters and subscriptions.
pub fn event_topics() -> [B256; 2] {
    [Transfer::SIGNATURE_HASH, Redeemed::SIGNATURE_HASH]
}

/// Decode a log against both signatures.
///
/// Returns `None` when the log is some other event on the same contract, or when its topics
/// don't fit the expected layout (e.g. an ERC-721 style `Transfer` with an indexed token id).
pub fn decode_log(log: &Log) -> Option<ChainEvent> {
    let topic0 = *log.topics().first()?;
    let contract = log.address();
    let block_number = log.block_number.unwrap_or_default();
    let tx_hash = log.transaction_hash;

    if topic0 == Transfer::SIGNATURE_HASH {
        let decoded = Transfer::decode_log(&log.inner).ok()?;
        Some(ChainEvent {
            contract,
            kind: EventKind::Transfer {
                to: decoded.data.to,
            },
            user: decoded.data.from,
            amount: decoded.data.value,
            block_number,
            tx_hash,
        })
    } else if topic0 == Redeemed::SIGNATURE_HASH {
        let decoded = Redeemed::decode_log(&log.inner).ok()?;
        Some(ChainEvent {
            contract,
            kind: EventKind::Redeemed {
                ticker_topic: decoded.data.ticker,
            },
            user: decoded.data.user,
            amount: decoded.data.amount,
            block_number,
            tx_hash,
        })
    } else {
        None
    }
}

/// Lowercase `0x`-prefixed hex, the canonical form for every persisted address.
pub fn lower_hex(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}
