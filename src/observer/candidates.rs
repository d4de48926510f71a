//! Candidate deposits awaiting finality.
//!
//! ```text
//! SEEN ─▶ AWAITING_RECEIPT ─▶ AWAITING_CONFIRMATIONS ─▶ CONFIRMED   (persist: confirmed)
//!              │    ▲                   │
//!              │    └────── reorg ──────┘
//!              ├─ receipt reverted ─────────────────────▶ persist: reverted
//!              └─ no receipt for ttl blocks ────────────▶ persist: failed
//! ```

use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use dashmap::DashMap;

use crate::blockchain::asset::TokenType;
use crate::blockchain::types::{ConfirmationStatus, TxReceipt};

/// Identity of one transfer: a native transfer has log index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub tx_hash: TxHash,
    pub token: TokenType,
    pub log_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Seen,
    AwaitingReceipt,
    AwaitingConfirmations { block_number: u64, confirmations: u64 },
    Confirmed { block_number: u64, confirmations: u64 },
}

/// Result of re-checking a candidate against the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Still below the threshold or waiting for a receipt.
    Waiting,
    /// A receipt we had seen is gone; waiting again.
    Reorged,
    Confirmed { block_number: u64, confirmations: u64 },
    Reverted { block_number: u64 },
    /// No receipt within the ttl.
    Expired,
}

/// A transfer into a user address that is not yet final.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: TransferKey,
    pub user_id: String,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub first_seen_block: u64,
    pub state: CandidateState,
}

impl Candidate {
    pub fn new(key: TransferKey, user_id: String, from: Address, to: Address, amount: U256, block: u64) -> Self {
        Self {
            key,
            user_id,
            from,
            to,
            amount,
            first_seen_block: block,
            state: CandidateState::Seen,
        }
    }

    /// Re-derive the state from a fresh receipt and head.
    pub fn advance(&mut self, receipt: Option<&TxReceipt>, head: u64, required: u64, ttl_blocks: u64) -> Transition {
        match ConfirmationStatus::evaluate(receipt, head, required) {
            ConfirmationStatus::Pending => {
                let reorged = matches!(self.state, CandidateState::AwaitingConfirmations { .. });
                self.state = CandidateState::AwaitingReceipt;
                if head.saturating_sub(self.first_seen_block) > ttl_blocks {
                    Transition::Expired
                } else if reorged {
                    Transition::Reorged
                } else {
                    Transition::Waiting
                }
            }
            ConfirmationStatus::Failed(_) => Transition::Reverted {
                block_number: receipt
                    .and_then(|r| r.block_number)
                    .unwrap_or(self.first_seen_block),
            },
            ConfirmationStatus::Confirming { current, .. } => {
                let block_number = receipt
                    .and_then(|r| r.block_number)
                    .unwrap_or(self.first_seen_block);
                self.state = CandidateState::AwaitingConfirmations {
                    block_number,
                    confirmations: current,
                };
                Transition::Waiting
            }
            ConfirmationStatus::Confirmed {
                block_number,
                confirmations,
            } => {
                self.state = CandidateState::Confirmed {
                    block_number,
                    confirmations,
                };
                Transition::Confirmed {
                    block_number,
                    confirmations,
                }
            }
        }
    }
}

/// Address/token pairs with candidates still in flight.
///
/// Shared with the backup scan and the sweep worker so that neither sweeps
/// funds the observer has not yet confirmed.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<DashMap<(Address, TokenType), usize>>,
}

impl InFlight {
    pub fn add(&self, address: Address, token: TokenType) {
        *self.inner.entry((address, token)).or_insert(0) += 1;
    }

    pub fn remove(&self, address: Address, token: TokenType) {
        let key = (address, token);
        let now_empty = match self.inner.get_mut(&key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if now_empty {
            self.inner.remove_if(&key, |_, count| *count == 0);
        }
    }

    pub fn contains(&self, address: &Address, token: &TokenType) -> bool {
        self.inner.contains_key(&(*address, *token))
    }
}
