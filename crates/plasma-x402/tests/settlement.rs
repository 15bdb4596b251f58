//! Facilitator state-machine tests against an unreachable provider.
//!
//! Protocol-shape rejections (recipient mismatch, unsupported scheme, bad
//! signature, replayed nonce) terminate before any on-chain call, so they
//! are fully observable offline; dispatch paths fail fast at the dead RPC
//! and must still produce durable, idempotent failure records.

use std::time::Duration;

use alloy::primitives::{address, Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

use x402::signer::encode_signature_hex;
use x402::{
    Authorization, ConfirmationPolicy, InvoiceStore, NetworkConfig, NetworkHandle, NonceManager,
    PaymentCompleted, PaymentOption, PaymentSubmitted, SettlementFacilitator, SettlementStatus,
    TransferWithAuthorization, TypedDataBuilder, PAYMENT_SUBMITTED_TYPE, SCHEME_EIP3009_TRANSFER,
};

const MERCHANT: Address = address!("00000000000000000000000000000000000000aa");

fn offline_provider() -> impl Provider + Clone {
    ProviderBuilder::new().connect_http("http://localhost:1".parse().unwrap())
}

fn make_facilitator(
    dir: &tempfile::TempDir,
) -> SettlementFacilitator<impl Provider + Clone> {
    let invoices = InvoiceStore::open(dir.path(), "invoices").unwrap();
    SettlementFacilitator::new(MERCHANT, invoices, NonceManager::local_only())
        .with_network(NetworkHandle {
            config: NetworkConfig::plasma(),
            provider: offline_provider(),
        })
        .with_network(NetworkHandle {
            config: NetworkConfig::ethereum(),
            provider: offline_provider(),
        })
}

fn plasma_option(recipient: Address) -> PaymentOption {
    let config = NetworkConfig::plasma();
    PaymentOption {
        network: config.network.clone(),
        chain_id: config.chain_id,
        token: config.token,
        token_symbol: config.token_symbol.clone(),
        token_decimals: config.token_decimals,
        amount: "1000000".to_string(),
        recipient,
        scheme: SCHEME_EIP3009_TRANSFER.to_string(),
        nonce: None,
        deadline: Some(u64::MAX / 2),
        router_contract: None,
        recommended_mode: None,
        fee_breakdown: None,
    }
}

/// Client-side signing of an EIP-3009 submission, as the chooser would do it.
fn signed_submission(
    invoice_id: &str,
    recipient: Address,
    signer: &PrivateKeySigner,
) -> PaymentSubmitted {
    let config = NetworkConfig::plasma();
    let option = plasma_option(recipient);
    let nonce = x402::signer::random_nonce();

    let auth = TransferWithAuthorization {
        from: signer.address(),
        to: recipient,
        value: U256::from(1_000_000u64),
        validAfter: U256::ZERO,
        validBefore: U256::from(u64::MAX / 2),
        nonce,
    };
    let doc = TypedDataBuilder::new().transfer_with_authorization(
        config.chain_id,
        config.token,
        &config.token_domain_name,
        &config.token_domain_version,
        &auth,
    );
    let hash = doc.eip712_signing_hash().unwrap();
    let sig = signer.sign_hash_sync(&hash).unwrap();

    PaymentSubmitted {
        kind: PAYMENT_SUBMITTED_TYPE.to_string(),
        invoice_id: invoice_id.to_string(),
        chosen_option: option,
        authorization: Authorization::Eip3009 {
            from: signer.address(),
            to: recipient,
            value: "1000000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX / 2,
            nonce,
            signature: encode_signature_hex(&sig),
        },
        scheme: SCHEME_EIP3009_TRANSFER.to_string(),
    }
}

#[tokio::test]
async fn recipient_mismatch_is_terminal_without_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let other = address!("00000000000000000000000000000000000000bb");
    let submitted = signed_submission("inv-mismatch", other, &signer);

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record.status, SettlementStatus::Failed);
    // A dispatch attempt against the dead RPC would classify as chain_error;
    // recipient_mismatch proves nothing was submitted.
    assert_eq!(record.error.as_deref(), Some("recipient_mismatch"));
    assert!(record.tx_hash.is_none());
}

#[tokio::test]
async fn unsupported_scheme_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let mut submitted = signed_submission("inv-scheme", MERCHANT, &signer);
    submitted.scheme = "barter-with-goats".to_string();

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record.status, SettlementStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("unsupported_scheme"));
}

#[tokio::test]
async fn unknown_network_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let mut submitted = signed_submission("inv-network", MERCHANT, &signer);
    submitted.chosen_option.network = "dogechain".to_string();

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record.error.as_deref(), Some("unsupported_network"));
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let mut submitted = signed_submission("inv-badsig", MERCHANT, &signer);
    if let Authorization::Eip3009 { signature, .. } = &mut submitted.authorization {
        // Flip one nibble of r
        let mut chars: Vec<char> = signature.chars().collect();
        chars[10] = if chars[10] == '0' { '1' } else { '0' };
        *signature = chars.into_iter().collect();
    }

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record.status, SettlementStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("invalid_signature"));
}

#[tokio::test]
async fn settling_twice_returns_the_cached_record() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let submitted = signed_submission("inv-idem", MERCHANT, &signer);

    // First attempt reaches dispatch and fails at the dead RPC.
    let first = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(first.status, SettlementStatus::Failed);
    assert_eq!(first.error.as_deref(), Some("chain_error"));

    // Second attempt is served from the store — identical record, no
    // re-dispatch (and no replayed-nonce rejection, which a second dispatch
    // attempt would produce).
    let second = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn preseeded_completion_is_returned_unmodified() {
    let dir = tempfile::tempdir().unwrap();
    let invoices = InvoiceStore::open(dir.path(), "invoices").unwrap();

    let cached = PaymentCompleted {
        kind: "payment-completed".to_string(),
        invoice_id: "inv-cached".to_string(),
        tx_hash: Some("0x1234".to_string()),
        network: "plasma".to_string(),
        chain_id: 9745,
        status: SettlementStatus::Confirmed,
        timestamp: 1_700_000_000,
        receipt: None,
        token_id: None,
        error: None,
    };
    invoices.set("inv-cached", &cached).unwrap();

    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();
    let submitted = signed_submission("inv-cached", MERCHANT, &signer);

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record, cached);
}

#[tokio::test]
async fn replayed_nonce_across_invoices_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let first = signed_submission("inv-replay-1", MERCHANT, &signer);
    let mut second = signed_submission("inv-replay-2", MERCHANT, &signer);

    // Reuse the first submission's authorization (and nonce) under a new invoice.
    second.authorization = first.authorization.clone();

    let first_record = facilitator.verify_and_settle(&first).await.unwrap();
    assert_eq!(first_record.error.as_deref(), Some("chain_error"));

    let second_record = facilitator.verify_and_settle(&second).await.unwrap();
    assert_eq!(second_record.status, SettlementStatus::Failed);
    assert_eq!(second_record.error.as_deref(), Some("replayed_nonce"));
}

#[tokio::test]
async fn late_caller_observes_the_in_flight_result() {
    let dir = tempfile::tempdir().unwrap();
    let invoices = InvoiceStore::open(dir.path(), "invoices").unwrap();

    let facilitator = SettlementFacilitator::new(
        MERCHANT,
        InvoiceStore::open(dir.path(), "invoices").unwrap(),
        NonceManager::local_only(),
    )
    .with_network(NetworkHandle {
        config: NetworkConfig::plasma(),
        provider: offline_provider(),
    })
    .with_confirmation_policy(ConfirmationPolicy {
        confirmations: 1,
        poll_interval: Duration::from_millis(50),
        timeout: Duration::from_secs(3),
    });

    // Simulate a peer that already claimed the invoice...
    invoices.create_if_absent("inv-race.inflight", &0u64).unwrap();

    let finished = PaymentCompleted {
        kind: "payment-completed".to_string(),
        invoice_id: "inv-race".to_string(),
        tx_hash: Some("0xabcd".to_string()),
        network: "plasma".to_string(),
        chain_id: 9745,
        status: SettlementStatus::Confirmed,
        timestamp: 1_700_000_000,
        receipt: None,
        token_id: None,
        error: None,
    };

    // ...and completes 300ms later.
    let writer = tokio::spawn({
        let finished = finished.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            invoices.set("inv-race", &finished).unwrap();
            invoices.delete("inv-race.inflight");
        }
    });

    let signer = PrivateKeySigner::random();
    let submitted = signed_submission("inv-race", MERCHANT, &signer);
    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    writer.await.unwrap();

    assert_eq!(record, finished);
}

#[tokio::test]
async fn abandoned_in_flight_marker_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let invoices = InvoiceStore::open(dir.path(), "invoices").unwrap();
    invoices.create_if_absent("inv-stuck.inflight", &0u64).unwrap();

    let facilitator = SettlementFacilitator::new(
        MERCHANT,
        InvoiceStore::open(dir.path(), "invoices").unwrap(),
        NonceManager::local_only(),
    )
    .with_network(NetworkHandle {
        config: NetworkConfig::plasma(),
        provider: offline_provider(),
    })
    .with_confirmation_policy(ConfirmationPolicy {
        confirmations: 1,
        poll_interval: Duration::from_millis(50),
        timeout: Duration::from_millis(600),
    });

    let signer = PrivateKeySigner::random();
    let submitted = signed_submission("inv-stuck", MERCHANT, &signer);
    let err = facilitator.verify_and_settle(&submitted).await.unwrap_err();
    assert!(matches!(err, x402::X402Error::RpcTimeout(_)));
}

fn signed_channel_submission(invoice_id: &str, signer: &PrivateKeySigner) -> PaymentSubmitted {
    let config = NetworkConfig::plasma();
    let channel = config.channel.unwrap();
    let nonce = x402::signer::random_nonce();
    let service_id = alloy::primitives::B256::new([0x5e; 32]);

    let receipt = x402::Receipt {
        payer: signer.address(),
        merchant: MERCHANT,
        amount: U256::from(5_000u64),
        serviceId: service_id,
        nonce,
        expiry: u64::MAX / 2,
    };
    let doc = TypedDataBuilder::new().channel_receipt(config.chain_id, channel, &receipt);
    let sig = signer.sign_hash_sync(&doc.eip712_signing_hash().unwrap()).unwrap();

    let mut option = plasma_option(MERCHANT);
    option.scheme = x402::SCHEME_CHANNEL_RECEIPT.to_string();
    option.amount = "5000".to_string();

    PaymentSubmitted {
        kind: PAYMENT_SUBMITTED_TYPE.to_string(),
        invoice_id: invoice_id.to_string(),
        chosen_option: option,
        authorization: Authorization::ChannelReceipt {
            payer: signer.address(),
            merchant: MERCHANT,
            amount: "5000".to_string(),
            service_id,
            nonce,
            expiry: u64::MAX / 2,
            signature: encode_signature_hex(&sig),
        },
        scheme: x402::SCHEME_CHANNEL_RECEIPT.to_string(),
    }
}

#[tokio::test]
async fn channel_receipt_reaches_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let submitted = signed_channel_submission("inv-channel", &signer);
    let record = facilitator.verify_and_settle(&submitted).await.unwrap();

    // All protocol checks passed; the dead RPC is the only failure left.
    assert_eq!(record.status, SettlementStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("chain_error"));
}

#[tokio::test]
async fn channel_receipt_for_wrong_merchant_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    let mut submitted = signed_channel_submission("inv-channel-bad", &signer);
    if let Authorization::ChannelReceipt { merchant, .. } = &mut submitted.authorization {
        *merchant = address!("00000000000000000000000000000000000000bb");
    }

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record.error.as_deref(), Some("recipient_mismatch"));
}

#[tokio::test]
async fn receive_authorization_must_target_the_mint_router() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();

    // Signed to the merchant instead of the mint router: the router could
    // never pull these funds via receiveWithAuthorization.
    let mut submitted = signed_submission("inv-receive-bad", MERCHANT, &signer);
    submitted.scheme = x402::SCHEME_EIP3009_RECEIVE.to_string();
    submitted.chosen_option.scheme = x402::SCHEME_EIP3009_RECEIVE.to_string();

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record.error.as_deref(), Some("recipient_mismatch"));
}

#[tokio::test]
async fn receive_authorization_to_mint_router_reaches_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let facilitator = make_facilitator(&dir);
    let signer = PrivateKeySigner::random();
    let config = NetworkConfig::plasma();
    let nft_router = config.nft_router.unwrap();
    let nonce = x402::signer::random_nonce();

    let auth = x402::ReceiveWithAuthorization {
        from: signer.address(),
        to: nft_router,
        value: U256::from(1_000_000u64),
        validAfter: U256::ZERO,
        validBefore: U256::from(u64::MAX / 2),
        nonce,
    };
    let doc = TypedDataBuilder::new().receive_with_authorization(
        config.chain_id,
        config.token,
        &config.token_domain_name,
        &config.token_domain_version,
        &auth,
    );
    let sig = signer.sign_hash_sync(&doc.eip712_signing_hash().unwrap()).unwrap();

    let mut option = plasma_option(MERCHANT);
    option.scheme = x402::SCHEME_EIP3009_RECEIVE.to_string();

    let submitted = PaymentSubmitted {
        kind: PAYMENT_SUBMITTED_TYPE.to_string(),
        invoice_id: "inv-receive".to_string(),
        chosen_option: option,
        authorization: Authorization::Eip3009 {
            from: signer.address(),
            to: nft_router,
            value: "1000000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX / 2,
            nonce,
            signature: encode_signature_hex(&sig),
        },
        scheme: x402::SCHEME_EIP3009_RECEIVE.to_string(),
    };

    let record = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(record.status, SettlementStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("chain_error"));
}

#[tokio::test]
async fn failure_records_are_durable_across_facilitators() {
    let dir = tempfile::tempdir().unwrap();
    let signer = PrivateKeySigner::random();
    let submitted = signed_submission("inv-durable", MERCHANT, &signer);

    let first = {
        let facilitator = make_facilitator(&dir);
        facilitator.verify_and_settle(&submitted).await.unwrap()
    };

    // A fresh facilitator over the same store must serve the same record.
    let facilitator = make_facilitator(&dir);
    let second = facilitator.verify_and_settle(&submitted).await.unwrap();
    assert_eq!(second, first);
}
