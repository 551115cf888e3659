// Peer identity keys: signing + PeerId derivation

use anyhow::Result;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use libp2p::PeerId;
use zeroize::{Zeroize, Zeroizing};

/// Identity keys used to prove ownership of an announced address
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    /// Raw Ed25519 public key
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get public key as hex (the marshaled form sent in join requests)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// libp2p PeerId derived from the public key
    pub fn peer_id(&self) -> Result<PeerId> {
        peer_id_from_public_key(&self.public_key_bytes())
    }

    /// Sign data
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Verify signature
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
        let verifying_key = VerifyingKey::from_bytes(
            public_key
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid public key"))?,
        )?;

        let sig = Ed25519Signature::from_bytes(
            signature
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid signature"))?,
        );

        Ok(verifying_key.verify(data, &sig).is_ok())
    }

    /// Serialize the secret key.
    /// Returns a `Zeroizing<Vec<u8>>` that wipes the key material on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    /// Deserialize keys from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(
            bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid key bytes"))?,
        );
        Ok(Self { signing_key })
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Derive the libp2p PeerId of a raw Ed25519 public key
pub fn peer_id_from_public_key(public_key: &[u8]) -> Result<PeerId> {
    let key = libp2p::identity::ed25519::PublicKey::try_from_bytes(public_key)
        .map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))?;
    Ok(libp2p::identity::PublicKey::from(key).to_peer_id())
}
