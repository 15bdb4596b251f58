//! Settlement facilitator: verifies signed payment submissions and settles
//! them on-chain, producing exactly one durable [`PaymentCompleted`] per
//! invoice.
//!
//! Per invoice the flow is `received → validated → dispatched → {confirmed |
//! failed}`. Protocol-shape failures (wrong recipient, unknown scheme,
//! replayed nonce, bad signature) and transport failures during relay all
//! become terminal `failed` records — callers need a response object, not a
//! crash, and every failure must be re-queryable for reconciliation. The
//! facilitator never retries; retry means a new invoice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::dyn_abi::TypedData;
use alloy::primitives::{Address, Bytes, Signature, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionReceipt;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::constants::{
    NetworkConfig, SCHEME_CHANNEL_RECEIPT, SCHEME_EIP3009_RECEIVE, SCHEME_EIP3009_TRANSFER,
    SCHEME_GASLESS_ROUTER,
};
use crate::contracts;
use crate::nonce::NonceManager;
use crate::payment::{
    Authorization, PaymentCompleted, PaymentSubmitted, SettlementReceipt, SettlementStatus,
    PAYMENT_COMPLETED_TYPE,
};
use crate::signer::{decode_signature_hex, recover_signer, split_signature};
use crate::store::InvoiceStore;
use crate::typed_data::TypedDataBuilder;
use crate::{Receipt, Transfer, TransferWithAuthorization, X402Error};

/// How long and how hard to wait for on-chain finality.
#[derive(Debug, Clone)]
pub struct ConfirmationPolicy {
    /// Blocks on top of the inclusion block. 1 = the receipt itself.
    pub confirmations: u64,
    /// Block-height poll cadence when `confirmations > 1`.
    pub poll_interval: Duration,
    /// Overall bound on receipt and confirmation waits. Exceeding it is a
    /// terminal timeout failure, never an indefinite hang.
    pub timeout: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            confirmations: 1,
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// One settleable network: its config plus a relayer-wallet provider.
pub struct NetworkHandle<P> {
    pub config: NetworkConfig,
    pub provider: P,
}

/// Multi-scheme settlement dispatcher.
pub struct SettlementFacilitator<P> {
    networks: HashMap<String, NetworkHandle<P>>,
    merchant: Address,
    invoices: InvoiceStore,
    nonces: NonceManager,
    confirmation: ConfirmationPolicy,
    /// Use packed 65-byte signatures instead of split (v, r, s) where both
    /// on-chain conventions exist.
    packed_signatures: bool,
    /// Mint a receipt NFT to the payer after a transfer-with-authorization
    /// settlement (best-effort, never downgrades the settlement).
    mint_receipts: bool,
    /// One mutex per chain id: the relayer's transaction-count nonce is a
    /// single-writer resource, so fetch-count → sign → broadcast must
    /// serialize per chain account.
    chain_locks: DashMap<u64, Arc<Mutex<()>>>,
    builder: TypedDataBuilder,
}

impl<P> SettlementFacilitator<P> {
    pub fn new(merchant: Address, invoices: InvoiceStore, nonces: NonceManager) -> Self {
        Self {
            networks: HashMap::new(),
            merchant,
            invoices,
            nonces,
            confirmation: ConfirmationPolicy::default(),
            packed_signatures: false,
            mint_receipts: false,
            chain_locks: DashMap::new(),
            builder: TypedDataBuilder::new(),
        }
    }

    /// Register a settleable network.
    pub fn with_network(mut self, handle: NetworkHandle<P>) -> Self {
        self.networks.insert(handle.config.network.clone(), handle);
        self
    }

    pub fn with_confirmation_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation = policy;
        self
    }

    pub fn with_packed_signatures(mut self, packed: bool) -> Self {
        self.packed_signatures = packed;
        self
    }

    pub fn with_mint_receipts(mut self, mint: bool) -> Self {
        self.mint_receipts = mint;
        self
    }

    fn chain_lock(&self, chain_id: u64) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn failed(
        &self,
        sub: &PaymentSubmitted,
        handle: &NetworkHandle<P>,
        code: &str,
    ) -> PaymentCompleted {
        PaymentCompleted::failed(
            &sub.invoice_id,
            &handle.config.network,
            handle.config.chain_id,
            code,
        )
    }

    fn confirmed(
        &self,
        sub: &PaymentSubmitted,
        handle: &NetworkHandle<P>,
        receipt: &TransactionReceipt,
        token_id: Option<U256>,
        mint_error: Option<String>,
    ) -> PaymentCompleted {
        let tx_hash = format!("{}", receipt.transaction_hash);
        PaymentCompleted {
            kind: PAYMENT_COMPLETED_TYPE.to_string(),
            invoice_id: sub.invoice_id.clone(),
            tx_hash: Some(tx_hash.clone()),
            network: handle.config.network.clone(),
            chain_id: handle.config.chain_id,
            status: SettlementStatus::Confirmed,
            timestamp: crate::unix_now(),
            receipt: Some(SettlementReceipt {
                transaction_hash: tx_hash,
                block_number: receipt.block_number,
                gas_used: Some(receipt.gas_used.to_string()),
                mint_error,
            }),
            token_id: token_id.map(|id| id.to_string()),
            error: None,
        }
    }

    /// Classify a dispatch error into a terminal record.
    fn dispatch_failed(
        &self,
        sub: &PaymentSubmitted,
        handle: &NetworkHandle<P>,
        error: &X402Error,
    ) -> PaymentCompleted {
        let code = match error {
            X402Error::RpcTimeout(_) => "rpc_timeout",
            X402Error::OnChainRevert(_) => "onchain_revert",
            X402Error::Chain(_) => "chain_error",
            _ => "settlement_error",
        };
        tracing::error!(
            invoice = %sub.invoice_id,
            scheme = %sub.scheme,
            error = %error,
            "settlement dispatch failed"
        );
        self.failed(sub, handle, code)
    }

    /// Decode the wire signature, recover the signer over `doc`, and require
    /// it to be `expected`.
    fn check_signature(
        &self,
        doc: &TypedData,
        signature: &str,
        expected: Address,
    ) -> Result<Signature, X402Error> {
        let bytes = decode_signature_hex(signature)?;
        let recovered = recover_signer(doc, &bytes)?;
        if recovered != expected {
            return Err(X402Error::Signature(format!(
                "recovered {recovered}, expected {expected}"
            )));
        }
        Signature::from_raw(&bytes)
            .map_err(|e| X402Error::Signature(format!("invalid signature: {e}")))
    }
}

impl<P: Provider> SettlementFacilitator<P> {
    /// Verify and settle one submission, idempotently.
    ///
    /// The completion record for an already-settled invoice is returned
    /// unmodified — settling twice never resubmits. At most one settlement
    /// attempt is ever in flight per invoice: late concurrent callers wait
    /// for the winner's terminal record.
    pub async fn verify_and_settle(
        &self,
        submitted: &PaymentSubmitted,
    ) -> Result<PaymentCompleted, X402Error> {
        let invoice_id = submitted.invoice_id.as_str();

        if let Some(done) = self.invoices.get::<PaymentCompleted>(invoice_id) {
            tracing::info!(invoice = invoice_id, "idempotent replay served from store");
            return Ok(done);
        }

        let marker = format!("{invoice_id}.inflight");
        if !self.invoices.create_if_absent(&marker, &crate::unix_now())? {
            tracing::info!(invoice = invoice_id, "settlement in flight, awaiting peer result");
            return self.await_peer_result(invoice_id, &marker).await;
        }

        match self.settle_inner(submitted).await {
            Ok(record) => {
                if let Err(e) = self.invoices.set(invoice_id, &record) {
                    self.invoices.delete(&marker);
                    tracing::error!(
                        invoice = invoice_id,
                        error = %e,
                        "FATAL: completion record not persisted — manual reconciliation required"
                    );
                    return Err(X402Error::Persistence(format!(
                        "completion record for {invoice_id} not persisted: {e}"
                    )));
                }
                self.invoices.delete(&marker);
                Ok(record)
            }
            Err(e) => {
                self.invoices.delete(&marker);
                Err(e)
            }
        }
    }

    /// Poll for the terminal record of a settlement some other caller owns.
    async fn await_peer_result(
        &self,
        invoice_id: &str,
        marker: &str,
    ) -> Result<PaymentCompleted, X402Error> {
        let deadline = Instant::now() + self.confirmation.timeout;
        loop {
            if let Some(done) = self.invoices.get::<PaymentCompleted>(invoice_id) {
                return Ok(done);
            }
            if self.invoices.get::<u64>(marker).is_none() {
                // Marker cleared without a record: the owning attempt errored
                // before reaching a terminal state.
                return Err(X402Error::Persistence(format!(
                    "concurrent settlement of {invoice_id} ended without a terminal record"
                )));
            }
            if Instant::now() >= deadline {
                return Err(X402Error::RpcTimeout(format!(
                    "timed out waiting for in-flight settlement of {invoice_id}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn settle_inner(
        &self,
        sub: &PaymentSubmitted,
    ) -> Result<PaymentCompleted, X402Error> {
        let opt = &sub.chosen_option;
        tracing::info!(
            invoice = %sub.invoice_id,
            scheme = %sub.scheme,
            network = %opt.network,
            amount = %opt.amount,
            "settlement received"
        );

        let Some(handle) = self.networks.get(&opt.network) else {
            tracing::warn!(invoice = %sub.invoice_id, network = %opt.network, "unknown network");
            return Ok(PaymentCompleted::failed(
                &sub.invoice_id,
                &opt.network,
                opt.chain_id,
                "unsupported_network",
            ));
        };

        if opt.recipient != self.merchant {
            tracing::warn!(
                invoice = %sub.invoice_id,
                expected = %self.merchant,
                got = %opt.recipient,
                "recipient mismatch — settlement refused"
            );
            return Ok(self.failed(sub, handle, "recipient_mismatch"));
        }

        match sub.scheme.as_str() {
            SCHEME_GASLESS_ROUTER => self.settle_router(sub, handle).await,
            SCHEME_EIP3009_TRANSFER => self.settle_eip3009_transfer(sub, handle).await,
            SCHEME_EIP3009_RECEIVE => self.settle_receive_mint(sub, handle).await,
            SCHEME_CHANNEL_RECEIPT => self.settle_channel(sub, handle).await,
            other => {
                tracing::warn!(invoice = %sub.invoice_id, scheme = other, "unsupported scheme");
                Ok(self.failed(sub, handle, "unsupported_scheme"))
            }
        }
    }

    async fn settle_router(
        &self,
        sub: &PaymentSubmitted,
        handle: &NetworkHandle<P>,
    ) -> Result<PaymentCompleted, X402Error> {
        let Authorization::RouterTransfer {
            token,
            from,
            to,
            amount,
            nonce,
            deadline,
            signature,
        } = &sub.authorization
        else {
            return Ok(self.failed(sub, handle, "malformed_authorization"));
        };
        let Some(router) = handle.config.router else {
            return Ok(self.failed(sub, handle, "unsupported_scheme"));
        };
        if *to != self.merchant {
            return Ok(self.failed(sub, handle, "recipient_mismatch"));
        }

        let (amount_u, nonce_u) = match (amount.parse::<U256>(), nonce.parse::<U256>()) {
            (Ok(a), Ok(n)) => (a, n),
            _ => return Ok(self.failed(sub, handle, "invalid_amount")),
        };

        let transfer = Transfer {
            token: *token,
            from: *from,
            to: *to,
            amount: amount_u,
            nonce: nonce_u,
            deadline: U256::from(*deadline),
        };
        let doc = self
            .builder
            .router_transfer(handle.config.chain_id, router, &transfer);
        let sig = match self.check_signature(&doc, signature, *from) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(invoice = %sub.invoice_id, error = %e, "signature check failed");
                return Ok(self.failed(sub, handle, "invalid_signature"));
            }
        };
        let (v, r, s) = split_signature(&sig);

        let lock = self.chain_lock(handle.config.chain_id);
        let _guard = lock.lock().await;

        let receipt = match contracts::router_gasless_transfer(
            &handle.provider,
            router,
            *token,
            *from,
            *to,
            amount_u,
            U256::from(*deadline),
            v,
            r,
            s,
            self.confirmation.timeout,
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => return Ok(self.dispatch_failed(sub, handle, &e)),
        };

        if let Err(e) = self.await_confirmations(&handle.provider, &receipt).await {
            return Ok(self.dispatch_failed(sub, handle, &e));
        }

        tracing::info!(
            invoice = %sub.invoice_id,
            payer = %from,
            tx = %receipt.transaction_hash,
            "router settlement confirmed"
        );
        Ok(self.confirmed(sub, handle, &receipt, None, None))
    }

    async fn settle_eip3009_transfer(
        &self,
        sub: &PaymentSubmitted,
        handle: &NetworkHandle<P>,
    ) -> Result<PaymentCompleted, X402Error> {
        let Authorization::Eip3009 {
            from,
            to,
            value,
            valid_after,
            valid_before,
            nonce,
            signature,
        } = &sub.authorization
        else {
            return Ok(self.failed(sub, handle, "malformed_authorization"));
        };
        if *to != self.merchant {
            return Ok(self.failed(sub, handle, "recipient_mismatch"));
        }
        let Ok(value_u) = value.parse::<U256>() else {
            return Ok(self.failed(sub, handle, "invalid_amount"));
        };

        // The signed (validAfter, validBefore) window is dispatched exactly
        // as signed — recomputing it would invalidate the signature.
        let auth = TransferWithAuthorization {
            from: *from,
            to: *to,
            value: value_u,
            validAfter: U256::from(*valid_after),
            validBefore: U256::from(*valid_before),
            nonce: *nonce,
        };
        let doc = self.builder.transfer_with_authorization(
            handle.config.chain_id,
            handle.config.token,
            &handle.config.token_domain_name,
            &handle.config.token_domain_version,
            &auth,
        );
        let sig = match self.check_signature(&doc, signature, *from) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(invoice = %sub.invoice_id, error = %e, "signature check failed");
                return Ok(self.failed(sub, handle, "invalid_signature"));
            }
        };

        // Claim the nonce before dispatch; it is never released afterwards —
        // a timed-out transaction may still mine, and releasing would allow
        // replay.
        if !self.nonces.consume(nonce) {
            return Ok(self.failed(sub, handle, "replayed_nonce"));
        }

        let lock = self.chain_lock(handle.config.chain_id);
        let _guard = lock.lock().await;

        let dispatched = if self.packed_signatures {
            contracts::transfer_with_authorization_packed(
                &handle.provider,
                handle.config.token,
                *from,
                *to,
                value_u,
                U256::from(*valid_after),
                U256::from(*valid_before),
                *nonce,
                Bytes::from(sig.as_bytes().to_vec()),
                self.confirmation.timeout,
            )
            .await
        } else {
            let (v, r, s) = split_signature(&sig);
            contracts::transfer_with_authorization_vrs(
                &handle.provider,
                handle.config.token,
                *from,
                *to,
                value_u,
                U256::from(*valid_after),
                U256::from(*valid_before),
                *nonce,
                v,
                r,
                s,
                self.confirmation.timeout,
            )
            .await
        };
        let receipt = match dispatched {
            Ok(receipt) => receipt,
            Err(e) => return Ok(self.dispatch_failed(sub, handle, &e)),
        };

        if let Err(e) = self.await_confirmations(&handle.provider, &receipt).await {
            return Ok(self.dispatch_failed(sub, handle, &e));
        }

        // Best-effort receipt-NFT mint; failure rides along on the record
        // without downgrading the settlement.
        let (token_id, mint_error) = match handle.config.nft_router {
            Some(nft_router) if self.mint_receipts => {
                match contracts::mint_receipt(
                    &handle.provider,
                    nft_router,
                    *from,
                    self.confirmation.timeout,
                )
                .await
                {
                    Ok((_, id)) => (id, None),
                    Err(e) => {
                        tracing::warn!(
                            invoice = %sub.invoice_id,
                            error = %e,
                            "post-payment receipt mint failed — settlement unaffected"
                        );
                        (None, Some(e.to_string()))
                    }
                }
            }
            _ => (None, None),
        };

        tracing::info!(
            invoice = %sub.invoice_id,
            payer = %from,
            tx = %receipt.transaction_hash,
            "eip3009 settlement confirmed"
        );
        Ok(self.confirmed(sub, handle, &receipt, token_id, mint_error))
    }

    async fn settle_receive_mint(
        &self,
        sub: &PaymentSubmitted,
        handle: &NetworkHandle<P>,
    ) -> Result<PaymentCompleted, X402Error> {
        let Authorization::Eip3009 {
            from,
            to,
            value,
            valid_after,
            valid_before,
            nonce,
            signature,
        } = &sub.authorization
        else {
            return Ok(self.failed(sub, handle, "malformed_authorization"));
        };
        let Some(nft_router) = handle.config.nft_router else {
            return Ok(self.failed(sub, handle, "unsupported_scheme"));
        };
        // receiveWithAuthorization requires the authorized recipient to be
        // the calling contract — the mint router, which forwards the funds.
        if *to != nft_router {
            tracing::warn!(
                invoice = %sub.invoice_id,
                expected = %nft_router,
                got = %to,
                "receive authorization not addressed to the mint router"
            );
            return Ok(self.failed(sub, handle, "recipient_mismatch"));
        }
        let Ok(value_u) = value.parse::<U256>() else {
            return Ok(self.failed(sub, handle, "invalid_amount"));
        };

        let auth = crate::ReceiveWithAuthorization {
            from: *from,
            to: *to,
            value: value_u,
            validAfter: U256::from(*valid_after),
            validBefore: U256::from(*valid_before),
            nonce: *nonce,
        };
        let doc = self.builder.receive_with_authorization(
            handle.config.chain_id,
            handle.config.token,
            &handle.config.token_domain_name,
            &handle.config.token_domain_version,
            &auth,
        );
        let sig = match self.check_signature(&doc, signature, *from) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(invoice = %sub.invoice_id, error = %e, "signature check failed");
                return Ok(self.failed(sub, handle, "invalid_signature"));
            }
        };

        if !self.nonces.consume(nonce) {
            return Ok(self.failed(sub, handle, "replayed_nonce"));
        }

        let lock = self.chain_lock(handle.config.chain_id);
        let _guard = lock.lock().await;

        let dispatched = if self.packed_signatures {
            contracts::pay_and_mint_receive_auth(
                &handle.provider,
                nft_router,
                handle.config.token,
                *from,
                value_u,
                U256::from(*valid_after),
                U256::from(*valid_before),
                *nonce,
                Bytes::from(sig.as_bytes().to_vec()),
                self.confirmation.timeout,
            )
            .await
        } else {
            let (v, r, s) = split_signature(&sig);
            contracts::pay_and_mint_vrs(
                &handle.provider,
                nft_router,
                handle.config.token,
                *from,
                value_u,
                U256::from(*valid_after),
                U256::from(*valid_before),
                *nonce,
                v,
                r,
                s,
                self.confirmation.timeout,
            )
            .await
        };
        let (receipt, token_id) = match dispatched {
            Ok(out) => out,
            Err(e) => return Ok(self.dispatch_failed(sub, handle, &e)),
        };

        if let Err(e) = self.await_confirmations(&handle.provider, &receipt).await {
            return Ok(self.dispatch_failed(sub, handle, &e));
        }

        tracing::info!(
            invoice = %sub.invoice_id,
            payer = %from,
            tx = %receipt.transaction_hash,
            token_id = ?token_id,
            "pay-and-mint settlement confirmed"
        );
        Ok(self.confirmed(sub, handle, &receipt, token_id, None))
    }

    async fn settle_channel(
        &self,
        sub: &PaymentSubmitted,
        handle: &NetworkHandle<P>,
    ) -> Result<PaymentCompleted, X402Error> {
        let Authorization::ChannelReceipt {
            payer,
            merchant,
            amount,
            service_id,
            nonce,
            expiry,
            signature,
        } = &sub.authorization
        else {
            return Ok(self.failed(sub, handle, "malformed_authorization"));
        };
        let Some(channel) = handle.config.channel else {
            return Ok(self.failed(sub, handle, "unsupported_scheme"));
        };
        if *merchant != self.merchant {
            return Ok(self.failed(sub, handle, "recipient_mismatch"));
        }
        let Ok(amount_u) = amount.parse::<U256>() else {
            return Ok(self.failed(sub, handle, "invalid_amount"));
        };

        let receipts = vec![Receipt {
            payer: *payer,
            merchant: *merchant,
            amount: amount_u,
            serviceId: *service_id,
            nonce: *nonce,
            expiry: *expiry,
        }];
        let doc = self
            .builder
            .channel_receipt(handle.config.chain_id, channel, &receipts[0]);
        let sig = match self.check_signature(&doc, signature, *payer) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(invoice = %sub.invoice_id, error = %e, "signature check failed");
                return Ok(self.failed(sub, handle, "invalid_signature"));
            }
        };

        if !self.nonces.consume(nonce) {
            return Ok(self.failed(sub, handle, "replayed_nonce"));
        }

        let lock = self.chain_lock(handle.config.chain_id);
        let _guard = lock.lock().await;

        let receipt = match contracts::settle_batch(
            &handle.provider,
            channel,
            receipts,
            vec![Bytes::from(sig.as_bytes().to_vec())],
            self.confirmation.timeout,
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => return Ok(self.dispatch_failed(sub, handle, &e)),
        };

        if let Err(e) = self.await_confirmations(&handle.provider, &receipt).await {
            return Ok(self.dispatch_failed(sub, handle, &e));
        }

        tracing::info!(
            invoice = %sub.invoice_id,
            payer = %payer,
            tx = %receipt.transaction_hash,
            "channel settlement confirmed"
        );
        Ok(self.confirmed(sub, handle, &receipt, None, None))
    }

    /// Wait for the configured confirmation depth beyond the inclusion block.
    async fn await_confirmations(
        &self,
        provider: &P,
        receipt: &TransactionReceipt,
    ) -> Result<(), X402Error> {
        if self.confirmation.confirmations <= 1 {
            return Ok(());
        }
        let Some(mined) = receipt.block_number else {
            return Err(X402Error::Chain(
                "receipt missing block number".to_string(),
            ));
        };
        let target = mined + self.confirmation.confirmations - 1;
        let deadline = Instant::now() + self.confirmation.timeout;

        loop {
            let head = provider
                .get_block_number()
                .await
                .map_err(|e| X402Error::Chain(format!("block height poll failed: {e}")))?;
            if head >= target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(X402Error::RpcTimeout(format!(
                    "confirmation timeout: head {head}, waiting for {target}"
                )));
            }
            tokio::time::sleep(self.confirmation.poll_interval).await;
        }
    }
}
