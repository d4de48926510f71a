//! Shared utilities for integration tests: an in-memory chain and a wired-up
//! set of components on a temporary ledger.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use custody_sweeper::blockchain::types::{
    BlockchainError, BlockchainResult, ChainBlock, ChainTransaction, SignedTransfer, TokenTransfer, TxReceipt,
};
use custody_sweeper::blockchain::{ChainRpc, SubmitterHandle, TokenType, TxSubmitter};
use custody_sweeper::config::{SweeperConfig, TokenConfig};
use custody_sweeper::lifecycle::{Components, Secrets, Shutdown};
use custody_sweeper::observer::{DepositObserver, InFlight, ObserverSettings};
use custody_sweeper::sweep::{GasTopUpEngine, SweepCoordinator, SweepEngine, SweepJob, TopUpRequestWorker};

pub const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";
pub const TEST_SECRET: &str = "integration-test-encryption-secret";
pub const CHAIN_ID: u64 = 31337;
pub const GAS_PRICE: u128 = 1_000_000_000;
pub const TOKEN_TRANSFER_GAS: u64 = 65_000;

/// `balanceOf(address)` selector.
const BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

pub fn ether(value: &str) -> U256 {
    alloy::primitives::utils::parse_ether(value).unwrap()
}

#[derive(Default)]
pub struct ChainState {
    pub head: u64,
    pub blocks: HashMap<u64, ChainBlock>,
    pub receipts: HashMap<TxHash, TxReceipt>,
    pub native: HashMap<Address, U256>,
    pub tokens: HashMap<(Address, Address), U256>,
    pub transfers: Vec<TokenTransfer>,
    pub failing_blocks: HashSet<u64>,
    pub fail_head: bool,
    pub fail_receipts: bool,
    /// Reject every broadcast.
    pub fail_sends: bool,
    /// Accept broadcasts but leave them unmined until `mine_held`.
    pub hold_receipts: bool,
    held: Vec<(TxHash, u64)>,
    pub nonces: HashMap<Address, u64>,
    pub sent: Vec<SignedTransfer>,
    next_id: u64,
}

/// A chain that mines every accepted transaction instantly at the head,
/// unless told to hold receipts back.
pub struct MockChain {
    pub state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(head: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                head,
                ..Default::default()
            }),
        })
    }

    fn next_hash(state: &mut ChainState) -> TxHash {
        state.next_id += 1;
        B256::from(U256::from(state.next_id).to_be_bytes::<32>())
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn fund(&self, address: Address, amount: U256) {
        *self.state.lock().unwrap().native.entry(address).or_default() += amount;
    }

    pub fn fund_token(&self, contract: Address, owner: Address, amount: U256) {
        *self.state.lock().unwrap().tokens.entry((contract, owner)).or_default() += amount;
    }

    pub fn native_balance(&self, address: Address) -> U256 {
        self.state.lock().unwrap().native.get(&address).copied().unwrap_or_default()
    }

    pub fn token_balance(&self, contract: Address, owner: Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .tokens
            .get(&(contract, owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn fail_block(&self, number: u64) {
        self.state.lock().unwrap().failing_blocks.insert(number);
    }

    pub fn heal_block(&self, number: u64) {
        self.state.lock().unwrap().failing_blocks.remove(&number);
    }

    pub fn hold_receipts(&self, hold: bool) {
        self.state.lock().unwrap().hold_receipts = hold;
    }

    /// Mine every held transaction at the current head.
    pub fn mine_held(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let head = state.head;
        let held = std::mem::take(&mut state.held);
        let mined = held.len();
        for (hash, gas_used) in held {
            state.receipts.insert(hash, receipt(hash, head, true, gas_used));
        }
        mined
    }

    pub fn sent(&self) -> Vec<SignedTransfer> {
        self.state.lock().unwrap().sent.clone()
    }

    /// A mined native transfer, credited to `to`.
    pub fn native_deposit(&self, from: Address, to: Address, amount: U256, block: u64) -> TxHash {
        let mut state = self.state.lock().unwrap();
        let hash = Self::next_hash(&mut state);
        state
            .blocks
            .entry(block)
            .or_insert_with(|| ChainBlock {
                number: block,
                transactions: Vec::new(),
            })
            .transactions
            .push(ChainTransaction {
                hash,
                from,
                to: Some(to),
                value: amount,
            });
        *state.native.entry(to).or_default() += amount;
        state.receipts.insert(hash, receipt(hash, block, true, 21_000));
        hash
    }

    /// A mined token transfer with its `Transfer` log, credited to `to`.
    pub fn token_deposit(&self, contract: Address, from: Address, to: Address, amount: U256, block: u64) -> TxHash {
        let mut state = self.state.lock().unwrap();
        let hash = Self::next_hash(&mut state);
        state
            .blocks
            .entry(block)
            .or_insert_with(|| ChainBlock {
                number: block,
                transactions: Vec::new(),
            })
            .transactions
            .push(ChainTransaction {
                hash,
                from,
                to: Some(contract),
                value: U256::ZERO,
            });
        state.transfers.push(TokenTransfer {
            token: contract,
            tx_hash: hash,
            log_index: 0,
            block_number: block,
            from,
            to,
            value: amount,
        });
        *state.tokens.entry((contract, to)).or_default() += amount;
        state.receipts.insert(hash, receipt(hash, block, true, TOKEN_TRANSFER_GAS));
        hash
    }
}

fn receipt(hash: TxHash, block: u64, success: bool, gas_used: u64) -> TxReceipt {
    TxReceipt {
        tx_hash: hash,
        block_number: Some(block),
        success,
        gas_used,
        effective_gas_price: GAS_PRICE,
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn chain_id(&self) -> BlockchainResult<u64> {
        Ok(CHAIN_ID)
    }

    async fn block_number(&self) -> BlockchainResult<u64> {
        let state = self.state.lock().unwrap();
        if state.fail_head {
            return Err(BlockchainError::Rpc("connection refused".to_string()));
        }
        Ok(state.head)
    }

    async fn block_with_transactions(&self, number: u64) -> BlockchainResult<Option<ChainBlock>> {
        let state = self.state.lock().unwrap();
        if state.failing_blocks.contains(&number) {
            return Err(BlockchainError::Rpc(format!("getBlock({number}) failed")));
        }
        if number > state.head {
            return Ok(None);
        }
        Ok(Some(state.blocks.get(&number).cloned().unwrap_or(ChainBlock {
            number,
            transactions: Vec::new(),
        })))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> BlockchainResult<Option<TxReceipt>> {
        let state = self.state.lock().unwrap();
        if state.fail_receipts {
            return Err(BlockchainError::Rpc("receipt unavailable".to_string()));
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn balance(&self, address: Address) -> BlockchainResult<U256> {
        Ok(self.native_balance(address))
    }

    async fn transaction_count(&self, address: Address) -> BlockchainResult<u64> {
        Ok(self.state.lock().unwrap().nonces.get(&address).copied().unwrap_or(0))
    }

    async fn gas_price(&self) -> BlockchainResult<u128> {
        Ok(GAS_PRICE)
    }

    async fn estimate_gas(&self, _from: Address, _to: Address, _value: U256, data: Bytes) -> BlockchainResult<u64> {
        Ok(if data.is_empty() { 21_000 } else { TOKEN_TRANSFER_GAS })
    }

    async fn call(&self, to: Address, data: Bytes) -> BlockchainResult<Bytes> {
        if data.len() != 36 || data[..4] != BALANCE_OF {
            return Err(BlockchainError::Rpc("unsupported call".to_string()));
        }
        let owner = Address::from_slice(&data[16..36]);
        Ok(self.token_balance(to, owner).abi_encode().into())
    }

    async fn send_transaction(&self, tx: &SignedTransfer) -> BlockchainResult<TxHash> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(BlockchainError::Rpc("connection reset".to_string()));
        }
        let expected = state.nonces.get(&tx.from).copied().unwrap_or(0);
        if tx.nonce != expected {
            return Err(BlockchainError::Nonce(format!("expected {expected}, got {}", tx.nonce)));
        }

        let fee = tx.max_fee();
        let native = state.native.get(&tx.from).copied().unwrap_or_default();
        if native < tx.value + fee {
            return Err(BlockchainError::Rpc("insufficient funds for gas * price + value".to_string()));
        }
        if let TokenType::Erc20(contract) = tx.asset {
            let held = state.tokens.get(&(contract, tx.from)).copied().unwrap_or_default();
            if held < tx.amount {
                return Err(BlockchainError::Rpc("execution reverted: insufficient balance".to_string()));
            }
            state.tokens.insert((contract, tx.from), held - tx.amount);
            *state.tokens.entry((contract, tx.recipient)).or_default() += tx.amount;
        }

        state.native.insert(tx.from, native - tx.value - fee);
        *state.native.entry(tx.to).or_default() += tx.value;
        state.nonces.insert(tx.from, expected + 1);

        if state.hold_receipts {
            state.held.push((tx.hash, tx.gas_limit));
        } else {
            let head = state.head;
            state.receipts.insert(tx.hash, receipt(tx.hash, head, true, tx.gas_limit));
        }
        state.sent.push(tx.clone());
        Ok(tx.hash)
    }

    async fn token_transfers(
        &self,
        tokens: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> BlockchainResult<Vec<TokenTransfer>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transfers
            .iter()
            .filter(|t| tokens.contains(&t.token) && (from_block..=to_block).contains(&t.block_number))
            .cloned()
            .collect())
    }
}

pub fn test_config(dir: &TempDir, tokens: &[Address]) -> SweeperConfig {
    let mut config = SweeperConfig::default();
    config.blockchain.chain_id = CHAIN_ID;
    config.blockchain.gas_price_multiplier = 1.0;
    config.blockchain.receipt_poll_ms = 10;
    config.blockchain.receipt_timeout_secs = 5;
    config.ledger.path = dir.path().join("ledger.db").to_string_lossy().into_owned();
    config.tokens = tokens
        .iter()
        .enumerate()
        .map(|(i, contract)| TokenConfig {
            symbol: format!("TK{i}"),
            contract: contract.to_string(),
            decimals: 18,
            min_sweep_amount: "1".to_string(),
        })
        .collect();
    config
}

/// Components on a mock chain, plus a running submitter.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub components: Components,
    pub submitter: SubmitterHandle,
    /// Shared by `observer` and `coordinator`, as in the daemon.
    pub in_flight: InFlight,
    pub shutdown: Shutdown,
    _dir: TempDir,
}

impl Harness {
    pub fn new(tokens: &[Address]) -> Self {
        Self::with_config(tokens, |_| {})
    }

    pub fn with_config(tokens: &[Address], adjust: impl FnOnce(&mut SweeperConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, tokens);
        adjust(&mut config);

        let chain = MockChain::new(100);
        let secrets = Secrets::new(TEST_MNEMONIC, TEST_SECRET);
        let components = Components::with_rpc(config, chain.clone(), &secrets).unwrap();
        chain.fund(components.master_wallet.address(), ether("10"));

        let shutdown = Shutdown::new();
        let (submitter, _task) = TxSubmitter::spawn(
            chain.clone(),
            &components.config.blockchain,
            shutdown.subscribe(),
        );
        Self {
            chain,
            components,
            submitter,
            in_flight: InFlight::default(),
            shutdown,
            _dir: dir,
        }
    }

    pub fn deposit_address(&self, user_id: &str) -> Address {
        self.components.service().get_deposit_address(user_id).unwrap()
    }

    pub fn observer(&self, sweeps: mpsc::Sender<SweepJob>) -> DepositObserver {
        self.observer_with(sweeps, self.in_flight.clone())
    }

    pub fn observer_with(&self, sweeps: mpsc::Sender<SweepJob>, in_flight: InFlight) -> DepositObserver {
        let c = &self.components;
        DepositObserver::new(
            c.rpc.clone(),
            c.ledger.clone(),
            c.registry.clone(),
            c.incidents.clone(),
            sweeps,
            in_flight,
            ObserverSettings::from_config(&c.config).ignoring([c.master_wallet.address()]),
        )
    }

    pub fn sweep_engine(&self) -> SweepEngine {
        let c = &self.components;
        SweepEngine::new(
            self.submitter.clone(),
            c.ledger.clone(),
            c.registry.clone(),
            c.config.blockchain.confirmation_blocks,
            c.config.sweep.cooldown_secs,
            c.config.blockchain.receipt_timeout_secs,
        )
    }

    pub fn gas_engine(&self) -> GasTopUpEngine {
        self.components.gas_engine(self.submitter.clone())
    }

    pub fn coordinator(&self) -> SweepCoordinator {
        let c = &self.components;
        SweepCoordinator::new(
            Arc::new(self.sweep_engine()),
            Arc::new(self.gas_engine()),
            c.registry.clone(),
            c.incidents.clone(),
            self.in_flight.clone(),
            c.master_address,
        )
    }

    pub fn request_worker(&self) -> TopUpRequestWorker {
        TopUpRequestWorker::new(
            Arc::new(self.gas_engine()),
            self.components.ledger.clone(),
            self.components.config.gas.request_poll_secs,
        )
    }

    /// Components of a second process (the operator CLI) on the same ledger file.
    pub fn second_process(&self) -> Components {
        let secrets = Secrets::new(TEST_MNEMONIC, TEST_SECRET);
        Components::with_rpc(self.components.config.clone(), self.chain.clone(), &secrets).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
