//! Payment option selection and submission signing.

use std::collections::HashMap;

use alloy::primitives::U256;
use alloy::providers::Provider;

use x402::contracts;
use x402::signer::{encode_signature_hex, random_nonce, SignerHandle};
use x402::{
    Authorization, PaymentOption, PaymentRequired, PaymentSubmitted, Transfer,
    TransferWithAuthorization, TypedDataBuilder, X402Error, PAYMENT_SUBMITTED_TYPE,
    SCHEME_EIP3009_TRANSFER, SCHEME_GASLESS_ROUTER,
};

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Client-side selection and signing configuration.
#[derive(Debug, Clone)]
pub struct ChooserConfig {
    /// Lower rank wins; unlisted networks sort last, ties break by the
    /// offer's option order.
    pub network_priority: HashMap<String, u32>,
    /// EIP-712 domain name used when the token's `name()` read fails.
    pub token_name_fallback: String,
    /// EIP-712 domain version used when the token's `version()` read fails.
    pub token_version_fallback: String,
    /// Fallback deadline offset when the option carries none.
    pub default_deadline_secs: u64,
}

impl Default for ChooserConfig {
    fn default() -> Self {
        let mut network_priority = HashMap::new();
        network_priority.insert("plasma".to_string(), 0);
        network_priority.insert("ethereum".to_string(), 1);
        Self {
            network_priority,
            token_name_fallback: "PlasmaUSD".to_string(),
            token_version_fallback: "1".to_string(),
            default_deadline_secs: 600,
        }
    }
}

/// Chooses a payment option and signs the matching authorization.
pub struct PaymentChooser<P> {
    signer: SignerHandle,
    providers: HashMap<String, P>,
    config: ChooserConfig,
    builder: TypedDataBuilder,
}

impl<P> PaymentChooser<P> {
    pub fn new(signer: SignerHandle) -> Self {
        Self {
            signer,
            providers: HashMap::new(),
            config: ChooserConfig::default(),
            builder: TypedDataBuilder::new(),
        }
    }

    /// Register an RPC provider for a network. Without one, on-chain lookups
    /// (router nonce, token name/version) fall back to configured defaults.
    pub fn with_provider(mut self, network: &str, provider: P) -> Self {
        self.providers.insert(network.to_string(), provider);
        self
    }

    pub fn with_config(mut self, config: ChooserConfig) -> Self {
        self.config = config;
        self
    }

    /// Rank of a network in the preference order.
    fn priority(&self, network: &str) -> u32 {
        self.config
            .network_priority
            .get(network)
            .copied()
            .unwrap_or(u32::MAX)
    }

    /// Pick the best option: lowest network rank, ties by list order.
    pub fn choose_option<'a>(
        &self,
        required: &'a PaymentRequired,
    ) -> Result<&'a PaymentOption, X402Error> {
        required
            .payment_options
            .iter()
            .enumerate()
            .min_by_key(|(index, option)| (self.priority(&option.network), *index))
            .map(|(_, option)| option)
            .ok_or(X402Error::NoPaymentOptions)
    }
}

impl<P: Provider> PaymentChooser<P> {
    /// Choose an option, sign its authorization, and assemble the
    /// [`PaymentSubmitted`] wire message.
    pub async fn prepare_submission(
        &self,
        required: &PaymentRequired,
    ) -> Result<PaymentSubmitted, X402Error> {
        let option = self.choose_option(required)?.clone();
        match option.scheme.as_str() {
            SCHEME_GASLESS_ROUTER => self.prepare_router(required, option).await,
            SCHEME_EIP3009_TRANSFER => self.prepare_eip3009(required, option).await,
            other => Err(X402Error::UnsupportedScheme(other.to_string())),
        }
    }

    async fn prepare_router(
        &self,
        required: &PaymentRequired,
        option: PaymentOption,
    ) -> Result<PaymentSubmitted, X402Error> {
        let router = option.router_contract.ok_or_else(|| {
            X402Error::Validation("router option is missing routerContract".to_string())
        })?;
        let deadline = option
            .deadline
            .unwrap_or_else(|| unix_now() + self.config.default_deadline_secs);
        let amount = option
            .amount
            .parse::<U256>()
            .map_err(|e| X402Error::Validation(format!("invalid amount: {e}")))?;
        let payer = self.signer.address();

        // The offer carries a placeholder nonce; the authoritative counter
        // lives on the router contract.
        let nonce = match self.providers.get(&option.network) {
            Some(provider) => match contracts::router_nonce(provider, router, payer).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "router nonce lookup failed — falling back to 0 (single-use invoices only)"
                    );
                    U256::ZERO
                }
            },
            None => {
                tracing::warn!(
                    network = %option.network,
                    "no provider configured — router nonce defaults to 0"
                );
                U256::ZERO
            }
        };

        let transfer = Transfer {
            token: option.token,
            from: payer,
            to: option.recipient,
            amount,
            nonce,
            deadline: U256::from(deadline),
        };
        let doc = self
            .builder
            .router_transfer(option.chain_id, router, &transfer);
        let signature = self.signer.sign_typed_data(&doc).await?;

        Ok(PaymentSubmitted {
            kind: PAYMENT_SUBMITTED_TYPE.to_string(),
            invoice_id: required.invoice_id.clone(),
            authorization: Authorization::RouterTransfer {
                token: option.token,
                from: payer,
                to: option.recipient,
                amount: option.amount.clone(),
                nonce: nonce.to_string(),
                deadline,
                signature: encode_signature_hex(&signature),
            },
            scheme: option.scheme.clone(),
            chosen_option: option,
        })
    }

    async fn prepare_eip3009(
        &self,
        required: &PaymentRequired,
        option: PaymentOption,
    ) -> Result<PaymentSubmitted, X402Error> {
        let payer = self.signer.address();
        let value = option
            .amount
            .parse::<U256>()
            .map_err(|e| X402Error::Validation(format!("invalid amount: {e}")))?;

        // Token name/version come from the contract when reachable; the
        // configured fallbacks keep the offline/dry-run path signable.
        let (token_name, token_version) = match self.providers.get(&option.network) {
            Some(provider) => {
                let name = contracts::token_name(provider, option.token).await;
                let version = contracts::token_version(provider, option.token).await;
                match (name, version) {
                    (Ok(name), Ok(version)) => (name, version),
                    (name, version) => {
                        tracing::warn!(
                            name_err = name.is_err(),
                            version_err = version.is_err(),
                            "token domain read failed — using configured fallbacks"
                        );
                        (
                            self.config.token_name_fallback.clone(),
                            self.config.token_version_fallback.clone(),
                        )
                    }
                }
            }
            None => (
                self.config.token_name_fallback.clone(),
                self.config.token_version_fallback.clone(),
            ),
        };

        let now = unix_now();
        // Back-dated by one second for clock skew between client and chain.
        let valid_after = now.saturating_sub(1);
        let valid_before = option
            .deadline
            .unwrap_or(now + self.config.default_deadline_secs);

        // Server-suggested nonce when present, fresh entropy otherwise.
        let nonce = match option.nonce.as_deref() {
            Some(suggested) => self.builder.bytes32(suggested)?,
            None => random_nonce(),
        };

        let auth = TransferWithAuthorization {
            from: payer,
            to: option.recipient,
            value,
            validAfter: U256::from(valid_after),
            validBefore: U256::from(valid_before),
            nonce,
        };
        let doc = self.builder.transfer_with_authorization(
            option.chain_id,
            option.token,
            &token_name,
            &token_version,
            &auth,
        );
        let signature = self.signer.sign_typed_data(&doc).await?;

        Ok(PaymentSubmitted {
            kind: PAYMENT_SUBMITTED_TYPE.to_string(),
            invoice_id: required.invoice_id.clone(),
            authorization: Authorization::Eip3009 {
                from: payer,
                to: option.recipient,
                value: option.amount.clone(),
                valid_after,
                valid_before,
                nonce,
                signature: encode_signature_hex(&signature),
            },
            scheme: option.scheme.clone(),
            chosen_option: option,
        })
    }
}
