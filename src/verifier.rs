//! Chain verification collaborator.
//!
//! The ledger never talks to the Stellar network directly; it asks a
//! [`ChainVerifier`] whether a submitted transaction hash is real and, if so,
//! for the confirmation facts to stamp onto the ledger row. The bundled
//! [`HorizonStub`] fabricates plausible facts so the bookkeeping layer can run
//! without a network; a production deployment would swap in a Horizon-backed
//! implementation.

use async_trait::async_trait;
use rand::Rng;

use crate::types::{PublicKey, TxHash};

/// Confirmation facts returned by the network for a valid transaction.
#[derive(Debug, Clone)]
pub struct ChainFacts {
    pub from_address: PublicKey,
    pub block_number: u64,
    pub ledger_sequence: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum VerifierError {
    /// The network rejected the hash; the payment must transition to FAILED.
    #[error("Transaction rejected by network: {0}")]
    Rejected(String),
    /// The verifier itself could not be reached. Not a verdict on the hash.
    #[error("Chain verifier unavailable: {0}")]
    Unavailable(String),
}

/// Capability to validate a transaction hash against the chain.
#[async_trait]
pub trait ChainVerifier: Send + Sync {
    async fn verify(&self, hash: &TxHash) -> Result<ChainFacts, VerifierError>;
}

/// Stand-in for a Horizon client. Accepts any non-empty hash and invents
/// block/ledger coordinates; the sender address is derived from the hash so
/// repeated verification of the same hash is stable.
#[derive(Debug, Clone, Default)]
pub struct HorizonStub;

#[async_trait]
impl ChainVerifier for HorizonStub {
    async fn verify(&self, hash: &TxHash) -> Result<ChainFacts, VerifierError> {
        if hash.as_str().trim().is_empty() {
            return Err(VerifierError::Rejected("empty transaction hash".into()));
        }
        let mut rng = rand::rng();
        Ok(ChainFacts {
            from_address: sender_for(hash),
            block_number: rng.random_range(1..1_000_000_000),
            ledger_sequence: rng.random_range(1..5_000_000),
        })
    }
}

fn sender_for(hash: &TxHash) -> PublicKey {
    let digest = hex::encode(hash.as_str().as_bytes());
    let tail: String = digest.chars().take(55).collect();
    PublicKey(format!("G{}", tail.to_uppercase()))
}
