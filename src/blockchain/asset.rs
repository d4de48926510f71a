//! Asset kinds a wallet can hold and how a transfer of each is built.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use serde::{Deserialize, Serialize};

use crate::blockchain::rpc::ChainRpc;
use crate::blockchain::types::{BlockchainError, BlockchainResult};

sol! {
    /// Subset of the ERC-20 interface the sweeper needs.
    #[derive(Debug)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// Gas for a plain value transfer between EOAs.
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// The asset a deposit or sweep moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "contract", rename_all = "snake_case")]
pub enum TokenType {
    /// The chain's native currency.
    Native,
    /// An ERC-20 token at the given contract address.
    Erc20(Address),
}

/// Transaction-level fields of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl TokenType {
    pub fn contract(&self) -> Option<Address> {
        match self {
            Self::Native => None,
            Self::Erc20(contract) => Some(*contract),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native)
    }

    /// Build the call moving `amount` of this asset to `recipient`.
    pub fn build_transfer(&self, recipient: Address, amount: U256) -> TransferCall {
        match self {
            Self::Native => TransferCall {
                to: recipient,
                value: amount,
                data: Bytes::new(),
            },
            Self::Erc20(contract) => TransferCall {
                to: *contract,
                value: U256::ZERO,
                data: IERC20::transferCall {
                    to: recipient,
                    amount,
                }
                .abi_encode()
                .into(),
            },
        }
    }

    /// Estimate gas for moving `amount` from `from` to `recipient`.
    ///
    /// Native estimates are made with a zero value so that a wallet holding
    /// exactly its balance does not fail the node's funds check; the result
    /// is floored at the intrinsic transfer cost.
    pub async fn estimate_gas(
        &self,
        rpc: &dyn ChainRpc,
        from: Address,
        recipient: Address,
        amount: U256,
    ) -> BlockchainResult<u64> {
        match self {
            Self::Native => {
                let estimate = rpc
                    .estimate_gas(from, recipient, U256::ZERO, Bytes::new())
                    .await?;
                Ok(estimate.max(NATIVE_TRANSFER_GAS))
            }
            Self::Erc20(_) => {
                let call = self.build_transfer(recipient, amount);
                rpc.estimate_gas(from, call.to, call.value, call.data).await
            }
        }
    }

    /// Balance of `owner` in this asset's smallest unit.
    pub async fn balance_of(&self, rpc: &dyn ChainRpc, owner: Address) -> BlockchainResult<U256> {
        match self {
            Self::Native => rpc.balance(owner).await,
            Self::Erc20(contract) => {
                let data = IERC20::balanceOfCall { account: owner }.abi_encode();
                let out = rpc.call(*contract, data.into()).await?;
                IERC20::balanceOfCall::abi_decode_returns(&out)
                    .map_err(|e| BlockchainError::Abi(format!("balanceOf on {contract}: {e}")))
            }
        }
    }
}

/// Query `symbol()` and `decimals()` of a token contract.
pub async fn token_metadata(rpc: &dyn ChainRpc, contract: Address) -> BlockchainResult<(String, u8)> {
    let out = rpc.call(contract, IERC20::symbolCall {}.abi_encode().into()).await?;
    let symbol = IERC20::symbolCall::abi_decode_returns(&out)
        .map_err(|e| BlockchainError::Abi(format!("symbol on {contract}: {e}")))?;

    let out = rpc.call(contract, IERC20::decimalsCall {}.abi_encode().into()).await?;
    let decimals = IERC20::decimalsCall::abi_decode_returns(&out)
        .map_err(|e| BlockchainError::Abi(format!("decimals on {contract}: {e}")))?;

    Ok((symbol, decimals))
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Erc20(contract) => write!(f, "{}", contract.to_string().to_lowercase()),
        }
    }
}

impl FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("native") {
            return Ok(Self::Native);
        }
        s.parse::<Address>()
            .map(Self::Erc20)
            .map_err(|e| format!("Invalid token '{s}': {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const USDT: Address = address!("dAC17F958D2ee523a2206206994597C13D831ec7");
    const MASTER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

    #[test]
    fn test_native_transfer_call() {
        let call = TokenType::Native.build_transfer(MASTER, U256::from(5));
        assert_eq!(call.to, MASTER);
        assert_eq!(call.value, U256::from(5));
        assert!(call.data.is_empty());
    }

    #[test]
    fn test_token_transfer_call() {
        let call = TokenType::Erc20(USDT).build_transfer(MASTER, U256::from(1_000_000));
        assert_eq!(call.to, USDT);
        assert_eq!(call.value, U256::ZERO);
        // 4-byte selector + two 32-byte words
        assert_eq!(call.data.len(), 68);
        assert_eq!(&call.data[..4], IERC20::transferCall::SELECTOR.as_slice());
    }

    #[test]
    fn test_token_type_string_forms() {
        assert_eq!(TokenType::Native.to_string(), "native");
        assert_eq!("NATIVE".parse::<TokenType>().unwrap(), TokenType::Native);

        let token = TokenType::Erc20(USDT);
        let key = token.to_string();
        assert_eq!(key, "0xdac17f958d2ee523a2206206994597c13d831ec7");
        assert_eq!(key.parse::<TokenType>().unwrap(), token);
        assert!("usdt".parse::<TokenType>().is_err());
    }
}
