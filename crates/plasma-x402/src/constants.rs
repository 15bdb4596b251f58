use alloy::primitives::{address, Address};

/// Plasma mainnet chain ID.
pub const PLASMA_CHAIN_ID: u64 = 9745;

/// Network name used in wire messages for the Plasma path.
pub const PLASMA_NETWORK: &str = "plasma";

/// Ethereum mainnet chain ID.
pub const ETHEREUM_CHAIN_ID: u64 = 1;

/// Network name used in wire messages for the Ethereum path.
pub const ETHEREUM_NETWORK: &str = "ethereum";

/// EIP-3009 transfer-with-authorization scheme (Plasma).
pub const SCHEME_EIP3009_TRANSFER: &str = "eip3009-transfer-with-auth";

/// EIP-3009 receive-with-authorization + receipt-NFT mint scheme (Plasma).
pub const SCHEME_EIP3009_RECEIVE: &str = "eip3009-receive-with-auth";

/// Relayer-paid router transfer scheme (Ethereum).
pub const SCHEME_GASLESS_ROUTER: &str = "erc20-gasless-router";

/// Payment-channel receipt scheme, settled via `settleBatch`.
pub const SCHEME_CHANNEL_RECEIPT: &str = "channel-receipt";

/// EIP-712 domain for router-transfer structs.
pub const ROUTER_DOMAIN_NAME: &str = "PaymentRouter";
pub const ROUTER_DOMAIN_VERSION: &str = "1";

/// EIP-712 domain for channel receipts.
pub const CHANNEL_DOMAIN_NAME: &str = "PlasmaPaymentChannel";
pub const CHANNEL_DOMAIN_VERSION: &str = "1";

/// pUSD token address on Plasma mainnet.
pub const PLASMA_USD_TOKEN: Address = address!("20b0d05e00000000000000000000000000000000");

/// USDC on Ethereum mainnet.
pub const ETHEREUM_USDC_TOKEN: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");

/// Default RPC endpoints.
pub const PLASMA_RPC_URL: &str = "https://rpc.plasma.to";
pub const ETHEREUM_RPC_URL: &str = "https://eth.llamarpc.com";

/// Runtime network configuration. Decouples the negotiator, client, and
/// facilitator from compile-time constants, enabling multi-chain support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub network: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub token: Address,
    pub token_symbol: String,
    pub token_decimals: u32,
    /// EIP-712 domain name pinned for the token. Clients fall back to this
    /// when the on-chain `name()` read fails; the facilitator always uses it.
    pub token_domain_name: String,
    pub token_domain_version: String,
    /// Gasless-transfer router, where deployed.
    pub router: Option<Address>,
    /// Payment-channel contract, where deployed.
    pub channel: Option<Address>,
    /// Receipt-NFT router, where deployed.
    pub nft_router: Option<Address>,
}

impl NetworkConfig {
    /// Plasma mainnet defaults.
    pub fn plasma() -> Self {
        Self {
            network: PLASMA_NETWORK.to_string(),
            chain_id: PLASMA_CHAIN_ID,
            rpc_url: PLASMA_RPC_URL.to_string(),
            token: PLASMA_USD_TOKEN,
            token_symbol: "pUSD".to_string(),
            token_decimals: 6,
            token_domain_name: "PlasmaUSD".to_string(),
            token_domain_version: "1".to_string(),
            router: None,
            channel: Some(address!("c4a22e1500000000000000000000000000000000")),
            nft_router: Some(address!("0f7a4b0c00000000000000000000000000000000")),
        }
    }

    /// Ethereum mainnet defaults.
    pub fn ethereum() -> Self {
        Self {
            network: ETHEREUM_NETWORK.to_string(),
            chain_id: ETHEREUM_CHAIN_ID,
            rpc_url: ETHEREUM_RPC_URL.to_string(),
            token: ETHEREUM_USDC_TOKEN,
            token_symbol: "USDC".to_string(),
            token_decimals: 6,
            token_domain_name: "USD Coin".to_string(),
            token_domain_version: "2".to_string(),
            router: Some(address!("c0de4a1100000000000000000000000000000000")),
            channel: None,
            nft_router: None,
        }
    }
}
