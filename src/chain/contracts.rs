//! Contract interfaces of the deployed token, pools, agent factory and
//! agent wallet. Signatures must match the deployment byte for byte.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use super::{ContractCall, RelayMode, WalletAction};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IDemoUsd {
        function mint(address to, uint256 amount) external;
        function balanceOf(address owner) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IYieldPool {
        function rewardRate() external view returns (uint256);
        function owner() external view returns (address);
        function totalSupply() external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function deposit(uint256 amount) external;
        function withdraw(uint256 amount) external;
        function setRewardRate(uint256 newRate) external;
        function setRewardRateByAgentOwner(uint256 agentId, uint256 newRate) external;
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IAgentFactory {
        function deployAgent(address operator) external returns (uint256);
        function deposit(uint256 agentId, uint256 amount) external;
        function execute(uint256 agentId, address target, bytes calldata data) external;
        function agentIdToWallet(uint256 agentId) external view returns (address);
        function agentIdToOwner(uint256 agentId) external view returns (address);
        function agentIdToOperator(uint256 agentId) external view returns (address);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IAgentWallet {
        function execute(address to, uint256 value, bytes calldata data) external returns (bool, bytes memory);
    }
}

/// Calldata the agent wallet must run for `action`.
pub fn wallet_action_calldata(action: &WalletAction) -> Bytes {
    match action {
        WalletAction::Withdraw { amount, .. } => {
            IYieldPool::withdrawCall { amount: *amount }.abi_encode().into()
        }
        WalletAction::Approve {
            spender, amount, ..
        } => IDemoUsd::approveCall {
            spender: *spender,
            amount: *amount,
        }
        .abi_encode()
        .into(),
        WalletAction::Deposit { amount, .. } => {
            IYieldPool::depositCall { amount: *amount }.abi_encode().into()
        }
    }
}

/// `(target, data)` arguments for `factory.execute` under the given relay mode.
pub fn relay_arguments(
    mode: RelayMode,
    wallet: Address,
    action: &WalletAction,
) -> (Address, Bytes) {
    let inner = wallet_action_calldata(action);
    match mode {
        RelayMode::Direct => (action.target(), inner),
        RelayMode::Wallet => {
            let wrapped = IAgentWallet::executeCall {
                to: action.target(),
                value: U256::ZERO,
                data: inner,
            }
            .abi_encode();
            (wallet, wrapped.into())
        }
    }
}

/// Destination address and calldata of a call, as sent by the operator.
/// Relayed calls go to `factory`.
pub fn encode_call(mode: RelayMode, factory: Address, call: &ContractCall) -> (Address, Bytes) {
    match call {
        ContractCall::Relayed {
            agent_id,
            wallet,
            action,
        } => {
            let (target, data) = relay_arguments(mode, *wallet, action);
            let outer = IAgentFactory::executeCall {
                agentId: *agent_id,
                target,
                data,
            }
            .abi_encode();
            (factory, outer.into())
        }
        ContractCall::Mint { token, to, amount } => (
            *token,
            IDemoUsd::mintCall {
                to: *to,
                amount: *amount,
            }
            .abi_encode()
            .into(),
        ),
        ContractCall::ApproveToken {
            token,
            spender,
            amount,
        } => (
            *token,
            IDemoUsd::approveCall {
                spender: *spender,
                amount: *amount,
            }
            .abi_encode()
            .into(),
        ),
        ContractCall::SetRewardRate { pool, rate } => (
            *pool,
            IYieldPool::setRewardRateCall { newRate: *rate }
                .abi_encode()
                .into(),
        ),
        ContractCall::SetRewardRateByAgentOwner {
            pool,
            agent_id,
            rate,
        } => (
            *pool,
            IYieldPool::setRewardRateByAgentOwnerCall {
                agentId: *agent_id,
                newRate: *rate,
            }
            .abi_encode()
            .into(),
        ),
        ContractCall::DepositPool { pool, amount } => (
            *pool,
            IYieldPool::depositCall { amount: *amount }.abi_encode().into(),
        ),
        ContractCall::DeployAgent {
            factory: deploy_factory,
            operator,
        } => (
            *deploy_factory,
            IAgentFactory::deployAgentCall {
                operator: *operator,
            }
            .abi_encode()
            .into(),
        ),
        ContractCall::FundAgent {
            factory: fund_factory,
            agent_id,
            amount,
        } => (
            *fund_factory,
            IAgentFactory::depositCall {
                agentId: *agent_id,
                amount: *amount,
            }
            .abi_encode()
            .into(),
        ),
    }
}
