//! Chain collaborators: owner lookup, key lookup and proof submission.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cp_authz::{address_of, sign, Address, Framing, SigningKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// A proof ready to be submitted on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSubmission {
    pub task_id: String,
    pub task_type: u8,
    pub zk_type: String,
    pub proof: String,
}

impl ProofSubmission {
    /// Bytes the submitter signs.
    fn signing_payload(&self) -> String {
        format!("{}{}{}{}", self.task_id, self.task_type, self.zk_type, self.proof)
    }
}

/// On-chain account registry and transaction submission.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Owner address registered for this provider's account.
    async fn owner_address(&self, node_id: &str) -> Result<Address>;

    /// Sign and broadcast a proof submission. Returns the transaction hash.
    async fn submit_ubi_proof(&self, key: &SigningKey, proof: &ProofSubmission) -> Result<String>;
}

/// Local signing keys.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn find_key(&self, address: &Address) -> Result<SigningKey>;
}

/// Keystore reading hex private keys from `<dir>/<address>`.
///
/// The file name may carry the `0x` prefix or not. The key's derived address
/// must match the requested one.
pub struct FileKeystore {
    dir: PathBuf,
}

impl FileKeystore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Keystore for FileKeystore {
    async fn find_key(&self, address: &Address) -> Result<SigningKey> {
        let with_prefix = address.to_string();
        let bare = with_prefix.trim_start_matches("0x").to_string();

        let mut raw = None;
        for name in [&with_prefix, &bare] {
            let path = self.dir.join(name);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                raw = Some(content);
                break;
            }
        }
        let raw = raw.with_context(|| format!("no key file for {address} in {}", self.dir.display()))?;

        let secret = hex::decode(raw.trim().trim_start_matches("0x")).context("key file is not hex")?;
        let key = SigningKey::from_slice(&secret).context("invalid secp256k1 private key")?;
        let derived = address_of(&key);
        if &derived != address {
            anyhow::bail!("key file for {address} holds the key of {derived}");
        }
        Ok(key)
    }
}

#[derive(Debug, Deserialize)]
struct OwnerResponse {
    owner_address: String,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    #[serde(flatten)]
    proof: &'a ProofSubmission,
    from: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_hash: String,
}

/// Chain access through an HTTP gateway.
///
/// - `GET {base}/accounts/{node_id}` -> `{owner_address}`
/// - `POST {base}/ubi/proofs` with the signed submission -> `{tx_hash}`
pub struct HttpChainGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChainGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChainClient for HttpChainGateway {
    async fn owner_address(&self, node_id: &str) -> Result<Address> {
        let url = format!("{}/accounts/{}", self.base_url, node_id);
        debug!(url = %url, "Fetching account owner");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to fetch account owner");
            anyhow::bail!("Failed to fetch account owner: {} - {}", status, body);
        }

        let owner: OwnerResponse = response.json().await?;
        Ok(owner.owner_address.parse()?)
    }

    async fn submit_ubi_proof(&self, key: &SigningKey, proof: &ProofSubmission) -> Result<String> {
        let url = format!("{}/ubi/proofs", self.base_url);
        let signature = sign(key, proof.signing_payload().as_bytes(), Framing::PersonalSign)?;
        let request = SubmitRequest {
            proof,
            from: address_of(key).to_string(),
            signature,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, task_id = %proof.task_id, "Failed to submit proof");
            anyhow::bail!("Failed to submit proof: {} - {}", status, body);
        }

        let submitted: SubmitResponse = response.json().await?;
        info!(task_id = %proof.task_id, tx = %submitted.tx_hash, "Proof submitted");
        Ok(submitted.tx_hash)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use mock::{MemoryKeystore, MockChainClient};

/// In-process stand-ins for the chain gateway and keystore.
#[cfg(any(test, feature = "test-util"))]
mod mock {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use cp_authz::{address_of, Address, SigningKey};
    use tracing::info;

    use super::{ChainClient, Keystore, ProofSubmission};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum MockMode {
        Succeed,
        Fail,
        Panic,
    }

    /// Chain client for tests and development.
    pub struct MockChainClient {
        owner: Address,
        mode: MockMode,
        counter: AtomicU64,
    }

    impl MockChainClient {
        pub fn new(owner: Address) -> Self {
            Self {
                owner,
                mode: MockMode::Succeed,
                counter: AtomicU64::new(0),
            }
        }

        /// Every submission fails.
        pub fn failing(owner: Address) -> Self {
            Self {
                mode: MockMode::Fail,
                ..Self::new(owner)
            }
        }

        /// Every submission panics.
        pub fn panicking(owner: Address) -> Self {
            Self {
                mode: MockMode::Panic,
                ..Self::new(owner)
            }
        }

        pub fn submissions(&self) -> u64 {
            self.counter.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainClient for MockChainClient {
        async fn owner_address(&self, _node_id: &str) -> Result<Address> {
            Ok(self.owner)
        }

        async fn submit_ubi_proof(&self, key: &SigningKey, proof: &ProofSubmission) -> Result<String> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                MockMode::Fail => anyhow::bail!("Mock chain configured to fail"),
                MockMode::Panic => panic!("mock chain panicked submitting task {}", proof.task_id),
                MockMode::Succeed => {
                    info!(task_id = %proof.task_id, from = %address_of(key), "[MOCK] Submitting proof");
                    Ok(format!("0x{n:064x}"))
                }
            }
        }
    }

    /// Keystore backed by a map.
    #[derive(Default)]
    pub struct MemoryKeystore {
        keys: HashMap<Address, SigningKey>,
    }

    impl MemoryKeystore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_key(mut self, key: SigningKey) -> Self {
            self.keys.insert(address_of(&key), key);
            self
        }
    }

    #[async_trait]
    impl Keystore for MemoryKeystore {
        async fn find_key(&self, address: &Address) -> Result<SigningKey> {
            self.keys
                .get(address)
                .cloned()
                .with_context(|| format!("no key for {address}"))
        }
    }
}
