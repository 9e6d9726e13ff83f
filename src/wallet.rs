use anyhow::{anyhow, Result};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signature, Signer};
use solana_sdk::transaction::VersionedTransaction;
use tracing::debug;

use crate::error::TradeError;

/// Signing capability of a connected wallet.
///
/// `sign_transaction` may wait on a human; callers bound it with a timeout.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn identity(&self) -> Pubkey;

    /// Fails with `SignatureRejected` when the user (or the key) refuses.
    async fn sign_transaction(&self, tx: VersionedTransaction) -> Result<VersionedTransaction, TradeError>;
}

/// Self-custody wallet backed by a Solana CLI keypair file.
pub struct KeypairWallet {
    keypair: Keypair,
}

impl KeypairWallet {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let keypair = read_keypair_file(path).map_err(|e| anyhow!("failed to read keypair {path}: {e}"))?;
        Ok(Self::new(keypair))
    }
}

#[async_trait]
impl WalletSigner for KeypairWallet {
    fn identity(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Fills our signature slot and leaves any signatures the service already placed.
    async fn sign_transaction(&self, mut tx: VersionedTransaction) -> Result<VersionedTransaction, TradeError> {
        let me = self.keypair.pubkey();
        let required = usize::from(tx.message.header().num_required_signatures);
        let slot = tx
            .message
            .static_account_keys()
            .iter()
            .take(required)
            .position(|key| *key == me)
            .ok_or_else(|| TradeError::SignatureRejected(format!("{me} is not a required signer of this transaction")))?;

        if tx.signatures.len() < required {
            tx.signatures.resize(required, Signature::default());
        }
        tx.signatures[slot] = self.keypair.sign_message(&tx.message.serialize());
        debug!(signer = %me, slot, required, "wallet.signed");
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::message::{Message, VersionedMessage};

    fn unsigned_for(payer: &Pubkey) -> VersionedTransaction {
        let message = VersionedMessage::Legacy(Message::new(&[], Some(payer)));
        VersionedTransaction { signatures: vec![Signature::default()], message }
    }

    #[tokio::test]
    async fn signs_own_slot_and_verifies() {
        let wallet = KeypairWallet::new(Keypair::new());
        let signed = wallet.sign_transaction(unsigned_for(&wallet.identity())).await.unwrap();
        assert_ne!(signed.signatures[0], Signature::default());
        assert!(signed.verify_with_results().iter().all(|ok| *ok));
    }

    #[tokio::test]
    async fn refuses_transactions_for_someone_else() {
        let wallet = KeypairWallet::new(Keypair::new());
        let other = Keypair::new().pubkey();
        let err = wallet.sign_transaction(unsigned_for(&other)).await.unwrap_err();
        assert!(matches!(err, TradeError::SignatureRejected(_)));
    }

    #[test]
    fn loads_keypair_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.json");
        let keypair = Keypair::new();
        solana_sdk::signature::write_keypair_file(&keypair, &path).unwrap();

        let wallet = KeypairWallet::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(wallet.identity(), keypair.pubkey());
    }

    #[test]
    fn missing_keypair_file_is_an_error() {
        assert!(KeypairWallet::from_file("/definitely/not/here.json").is_err());
    }
}
