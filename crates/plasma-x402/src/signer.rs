//! Capability-based signing over EIP-712 documents.
//!
//! The settlement core never handles raw key material directly: anything
//! that can sign a 32-byte prehash qualifies as a signer. Three backends are
//! provided — an in-memory key, a key loaded from a file, and a Vault
//! transit-engine remote signer — selected by [`SignerHandle::from_config`].

use alloy::dyn_abi::TypedData;
use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use crate::X402Error;

/// secp256k1 curve order N / 2 — signatures with s > this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Signer backend selection, decided once at startup by the host's config
/// loader.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignerConfig {
    /// Hex-encoded private key held in memory (env-injected).
    LocalKey { private_key: String },
    /// Private key read from a file path.
    KeyFile { path: String },
    /// Vault transit engine; the key never leaves the secrets service.
    Vault {
        addr: String,
        token: String,
        key_name: String,
        /// The key's on-chain address (transit cannot be queried for it).
        address: Address,
    },
}

/// A signing capability: produces (v, r, s) over a 32-byte prehash.
#[derive(Debug)]
pub enum SignerHandle {
    LocalKey(PrivateKeySigner),
    Vault(VaultTransitSigner),
}

impl SignerHandle {
    /// Construct the backend named by the config.
    pub fn from_config(config: &SignerConfig) -> Result<Self, X402Error> {
        match config {
            SignerConfig::LocalKey { private_key } => {
                let signer: PrivateKeySigner = private_key
                    .parse()
                    .map_err(|e| X402Error::Config(format!("invalid private key: {e}")))?;
                Ok(SignerHandle::LocalKey(signer))
            }
            SignerConfig::KeyFile { path } => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| X402Error::Config(format!("cannot read key file {path}: {e}")))?;
                let signer: PrivateKeySigner = raw
                    .trim()
                    .parse()
                    .map_err(|e| X402Error::Config(format!("invalid key in {path}: {e}")))?;
                Ok(SignerHandle::LocalKey(signer))
            }
            SignerConfig::Vault {
                addr,
                token,
                key_name,
                address,
            } => Ok(SignerHandle::Vault(VaultTransitSigner::new(
                addr, token, key_name, *address,
            ))),
        }
    }

    /// Wrap an in-memory key directly (tests, local tooling).
    pub fn local(signer: PrivateKeySigner) -> Self {
        SignerHandle::LocalKey(signer)
    }

    pub fn address(&self) -> Address {
        match self {
            SignerHandle::LocalKey(signer) => signer.address(),
            SignerHandle::Vault(signer) => signer.address,
        }
    }

    /// Sign a 32-byte prehash.
    pub async fn sign_hash(&self, hash: B256) -> Result<Signature, X402Error> {
        match self {
            SignerHandle::LocalKey(signer) => signer
                .sign_hash_sync(&hash)
                .map_err(|e| X402Error::Signature(format!("signing failed: {e}"))),
            SignerHandle::Vault(signer) => signer.sign_hash(hash).await,
        }
    }

    /// Hash an EIP-712 document (domainSeparator ∥ structHash) and sign it.
    pub async fn sign_typed_data(&self, doc: &TypedData) -> Result<Signature, X402Error> {
        let hash = doc
            .eip712_signing_hash()
            .map_err(|e| X402Error::Signature(format!("typed-data hash failed: {e}")))?;
        self.sign_hash(hash).await
    }
}

/// Remote signer against a Vault transit sign endpoint.
#[derive(Debug)]
pub struct VaultTransitSigner {
    http: reqwest::Client,
    addr: String,
    token: String,
    key_name: String,
    pub address: Address,
}

#[derive(Deserialize)]
struct VaultSignData {
    signature: String,
}

#[derive(Deserialize)]
struct VaultSignResponse {
    data: VaultSignData,
}

impl VaultTransitSigner {
    pub fn new(addr: &str, token: &str, key_name: &str, address: Address) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_string(),
            token: token.to_string(),
            key_name: key_name.to_string(),
            address,
        }
    }

    async fn sign_hash(&self, hash: B256) -> Result<Signature, X402Error> {
        let url = format!("{}/v1/transit/sign/{}", self.addr, self.key_name);
        let body = serde_json::json!({
            "input": BASE64.encode(hash),
            "prehashed": true,
            "marshaling_algorithm": "raw",
        });

        let resp = self
            .http
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(&body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| X402Error::Signature(format!("vault sign request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(X402Error::Signature(format!(
                "vault sign returned {}",
                resp.status()
            )));
        }

        let parsed: VaultSignResponse = resp
            .json()
            .await
            .map_err(|e| X402Error::Signature(format!("vault sign response malformed: {e}")))?;

        // Format: "vault:v1:<base64(65-byte signature)>"
        let encoded = parsed
            .data
            .signature
            .rsplit(':')
            .next()
            .unwrap_or(&parsed.data.signature);
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| X402Error::Signature(format!("vault signature not base64: {e}")))?;

        Signature::from_raw(&bytes)
            .map_err(|e| X402Error::Signature(format!("vault signature invalid: {e}")))
    }
}

/// Recover the signer of an EIP-712 document from a 65-byte signature.
/// Rejects high-s signatures to prevent malleability (EIP-2).
pub fn recover_signer(doc: &TypedData, signature_bytes: &[u8]) -> Result<Address, X402Error> {
    if signature_bytes.len() != 65 {
        return Err(X402Error::Signature(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }

    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| X402Error::Signature(format!("invalid signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(X402Error::Signature(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }

    let hash = doc
        .eip712_signing_hash()
        .map_err(|e| X402Error::Signature(format!("typed-data hash failed: {e}")))?;
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| X402Error::Signature(format!("recovery failed: {e}")))
}

/// Split a signature into the (v, r, s) calling convention used by the
/// on-chain entry points. Electrum notation: v ∈ {27, 28}.
pub fn split_signature(sig: &Signature) -> (u8, B256, B256) {
    let v = if sig.v() { 28 } else { 27 };
    (v, B256::from(sig.r()), B256::from(sig.s()))
}

/// Encode a signature to a hex string with 0x prefix (65 bytes -> 0x + 130 hex).
pub fn encode_signature_hex(sig: &Signature) -> String {
    format!("0x{}", alloy::hex::encode(sig.as_bytes()))
}

/// Decode a 0x-prefixed (or bare) hex signature into raw bytes.
pub fn decode_signature_hex(signature: &str) -> Result<Vec<u8>, X402Error> {
    alloy::hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|e| X402Error::Signature(format!("invalid hex signature: {e}")))
}

/// Generate a random 32-byte nonce (keccak256 of 32 random bytes).
/// Uses `rand::fill` which delegates to the OS CSPRNG.
pub fn random_nonce() -> B256 {
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    keccak256(bytes)
}
