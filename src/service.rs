//! The surface other systems use: deposit addresses, balances and ledger reads.

use std::sync::Arc;

use alloy::primitives::{Address, U256};

use crate::blockchain::asset::TokenType;
use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::types::BlockchainResult;
use crate::custody::{CustodyResult, WalletRegistry};
use crate::ledger::Ledger;

#[derive(Clone)]
pub struct CustodyService {
    rpc: Arc<dyn ChainRpc>,
    ledger: Ledger,
    registry: Arc<WalletRegistry>,
}

impl CustodyService {
    pub fn new(rpc: Arc<dyn ChainRpc>, ledger: Ledger, registry: Arc<WalletRegistry>) -> Self {
        Self {
            rpc,
            ledger,
            registry,
        }
    }

    /// The user's deposit address, created on first request.
    pub fn get_deposit_address(&self, user_id: &str) -> CustodyResult<Address> {
        self.registry.get_deposit_address(user_id)
    }

    /// Live balance of `address` in `token`, in base units.
    pub async fn get_onchain_balance(&self, address: Address, token: TokenType) -> BlockchainResult<U256> {
        token.balance_of(self.rpc.as_ref(), address).await
    }

    /// Read access to deposits, sweeps, gas supplies and incidents.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<WalletRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for CustodyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyService")
            .field("wallets", &self.registry.len())
            .finish()
    }
}
