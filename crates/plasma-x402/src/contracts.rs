//! Relayer-side on-chain call helpers.
//!
//! Every send is bounded by a 30-second timeout and every receipt wait by
//! the caller's confirmation policy, so a congested chain or unresponsive
//! RPC can never hang a settlement indefinitely. Reverts map to
//! [`X402Error::OnChainRevert`], timeouts to [`X402Error::RpcTimeout`], and
//! transport failures to [`X402Error::Chain`].

use std::time::Duration;

use alloy::consensus::TxReceipt as _;
use alloy::primitives::{b256, Address, Bytes, B256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionReceipt;

use crate::{
    IEip3009Token, IEip3009TokenPacked, INftReceiptRouter, IPaymentChannel, IPaymentRouter,
    Receipt, X402Error,
};

/// Bound on transaction submission (not confirmation).
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// ERC-721 `Transfer(address,address,uint256)` topic, used to recover minted
/// token ids from receipts.
const ERC721_TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

fn send_timeout_err(what: &str) -> X402Error {
    X402Error::RpcTimeout(format!("{what} send timed out after {}s", SEND_TIMEOUT.as_secs()))
}

fn receipt_timeout_err(what: &str, bound: Duration) -> X402Error {
    X402Error::RpcTimeout(format!(
        "{what} receipt timed out after {}s",
        bound.as_secs()
    ))
}

/// Await a pending transaction's receipt and require on-chain success.
macro_rules! confirm {
    ($what:expr, $call:expr, $receipt_timeout:expr) => {{
        let pending = tokio::time::timeout(SEND_TIMEOUT, $call.send())
            .await
            .map_err(|_| send_timeout_err($what))?
            .map_err(|e| X402Error::Chain(format!("{} send failed: {e}", $what)))?;

        let receipt = tokio::time::timeout($receipt_timeout, pending.get_receipt())
            .await
            .map_err(|_| receipt_timeout_err($what, $receipt_timeout))?
            .map_err(|e| X402Error::Chain(format!("{} receipt failed: {e}", $what)))?;

        if !receipt.status() {
            return Err(X402Error::OnChainRevert(format!("{} reverted", $what)));
        }
        receipt
    }};
}

/// Relayer-signed call to the router's gasless-transfer entry.
#[allow(clippy::too_many_arguments)]
pub async fn router_gasless_transfer<P: Provider>(
    provider: &P,
    router: Address,
    token: Address,
    from: Address,
    to: Address,
    amount: U256,
    deadline: U256,
    v: u8,
    r: B256,
    s: B256,
    receipt_timeout: Duration,
) -> Result<TransactionReceipt, X402Error> {
    let contract = IPaymentRouter::new(router, provider);
    let receipt = confirm!(
        "gaslessTransfer",
        contract.gaslessTransfer(token, from, to, amount, deadline, v, r, s),
        receipt_timeout
    );
    Ok(receipt)
}

/// `transferWithAuthorization` with the split (v, r, s) calling convention.
/// The (validAfter, validBefore) window is the exact signed one — never
/// recomputed here.
#[allow(clippy::too_many_arguments)]
pub async fn transfer_with_authorization_vrs<P: Provider>(
    provider: &P,
    token: Address,
    from: Address,
    to: Address,
    value: U256,
    valid_after: U256,
    valid_before: U256,
    nonce: B256,
    v: u8,
    r: B256,
    s: B256,
    receipt_timeout: Duration,
) -> Result<TransactionReceipt, X402Error> {
    let contract = IEip3009Token::new(token, provider);
    let receipt = confirm!(
        "transferWithAuthorization",
        contract.transferWithAuthorization(from, to, value, valid_after, valid_before, nonce, v, r, s),
        receipt_timeout
    );
    Ok(receipt)
}

/// `transferWithAuthorization` with the packed 65-byte signature convention.
#[allow(clippy::too_many_arguments)]
pub async fn transfer_with_authorization_packed<P: Provider>(
    provider: &P,
    token: Address,
    from: Address,
    to: Address,
    value: U256,
    valid_after: U256,
    valid_before: U256,
    nonce: B256,
    signature: Bytes,
    receipt_timeout: Duration,
) -> Result<TransactionReceipt, X402Error> {
    let contract = IEip3009TokenPacked::new(token, provider);
    let receipt = confirm!(
        "transferWithAuthorization",
        contract.transferWithAuthorization(
            from,
            to,
            value,
            valid_after,
            valid_before,
            nonce,
            signature
        ),
        receipt_timeout
    );
    Ok(receipt)
}

/// Settle a batch of channel receipts.
pub async fn settle_batch<P: Provider>(
    provider: &P,
    channel: Address,
    receipts: Vec<Receipt>,
    signatures: Vec<Bytes>,
    receipt_timeout: Duration,
) -> Result<TransactionReceipt, X402Error> {
    let contract = IPaymentChannel::new(channel, provider);
    let receipt = confirm!(
        "settleBatch",
        contract.settleBatch(receipts, signatures),
        receipt_timeout
    );
    Ok(receipt)
}

/// Pay via `receiveWithAuthorization` and mint a receipt NFT in one call,
/// packed-signature convention. Returns the receipt and the minted token id
/// when it can be recovered from the logs.
#[allow(clippy::too_many_arguments)]
pub async fn pay_and_mint_receive_auth<P: Provider>(
    provider: &P,
    nft_router: Address,
    token: Address,
    payer: Address,
    value: U256,
    valid_after: U256,
    valid_before: U256,
    nonce: B256,
    signature: Bytes,
    receipt_timeout: Duration,
) -> Result<(TransactionReceipt, Option<U256>), X402Error> {
    let contract = INftReceiptRouter::new(nft_router, provider);
    let receipt = confirm!(
        "payAndMintReceiveAuth",
        contract.payAndMintReceiveAuth(token, payer, value, valid_after, valid_before, nonce, signature),
        receipt_timeout
    );
    let token_id = token_id_from_receipt(&receipt);
    Ok((receipt, token_id))
}

/// Pay-and-mint with the split (v, r, s) convention.
#[allow(clippy::too_many_arguments)]
pub async fn pay_and_mint_vrs<P: Provider>(
    provider: &P,
    nft_router: Address,
    token: Address,
    payer: Address,
    value: U256,
    valid_after: U256,
    valid_before: U256,
    nonce: B256,
    v: u8,
    r: B256,
    s: B256,
    receipt_timeout: Duration,
) -> Result<(TransactionReceipt, Option<U256>), X402Error> {
    let contract = INftReceiptRouter::new(nft_router, provider);
    let receipt = confirm!(
        "payAndMintVRS",
        contract.payAndMintVRS(token, payer, value, valid_after, valid_before, nonce, v, r, s),
        receipt_timeout
    );
    let token_id = token_id_from_receipt(&receipt);
    Ok((receipt, token_id))
}

/// Mint a receipt NFT to `to` with no payment attached (the post-payment
/// side effect of the transfer-with-authorization scheme).
pub async fn mint_receipt<P: Provider>(
    provider: &P,
    nft_router: Address,
    to: Address,
    receipt_timeout: Duration,
) -> Result<(TransactionReceipt, Option<U256>), X402Error> {
    let contract = INftReceiptRouter::new(nft_router, provider);
    let receipt = confirm!("mintReceipt", contract.mintReceipt(to), receipt_timeout);
    let token_id = token_id_from_receipt(&receipt);
    Ok((receipt, token_id))
}

/// Read the router's authoritative nonce counter for `owner`.
pub async fn router_nonce<P: Provider>(
    provider: &P,
    router: Address,
    owner: Address,
) -> Result<U256, X402Error> {
    let contract = IPaymentRouter::new(router, provider);
    contract
        .nonces(owner)
        .call()
        .await
        .map_err(|e| X402Error::Chain(format!("router nonce read failed: {e}")))
}

/// Read the token's EIP-712 domain name.
pub async fn token_name<P: Provider>(provider: &P, token: Address) -> Result<String, X402Error> {
    let contract = IEip3009Token::new(token, provider);
    contract
        .name()
        .call()
        .await
        .map_err(|e| X402Error::Chain(format!("token name read failed: {e}")))
}

/// Read the token's EIP-712 domain version.
pub async fn token_version<P: Provider>(provider: &P, token: Address) -> Result<String, X402Error> {
    let contract = IEip3009Token::new(token, provider);
    contract
        .version()
        .call()
        .await
        .map_err(|e| X402Error::Chain(format!("token version read failed: {e}")))
}

/// Recover a minted ERC-721 token id from a receipt's Transfer logs.
fn token_id_from_receipt(receipt: &TransactionReceipt) -> Option<U256> {
    receipt.inner.logs().iter().find_map(|log| {
        let topics = log.inner.data.topics();
        if topics.len() == 4 && topics[0] == ERC721_TRANSFER_TOPIC {
            Some(U256::from_be_bytes(topics[3].0))
        } else {
            None
        }
    })
}
