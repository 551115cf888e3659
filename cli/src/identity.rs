// Identity key file: hex-encoded Ed25519 secret, created on first use

use anyhow::{Context, Result};
use std::path::Path;
use wsstar_core::IdentityKeys;
use zeroize::Zeroizing;

/// Load the identity stored at `path`, generating and saving one if absent
pub fn load_or_create(path: &Path) -> Result<IdentityKeys> {
    if path.exists() {
        let contents = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read identity file {}", path.display()))?,
        );
        let bytes = Zeroizing::new(
            hex::decode(contents.trim()).context("Identity file is not valid hex")?,
        );
        return IdentityKeys::from_bytes(&bytes).context("Identity file holds an invalid key");
    }

    let keys = IdentityKeys::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create identity directory")?;
    }
    let encoded = Zeroizing::new(hex::encode(keys.to_bytes().as_slice()));
    std::fs::write(path, encoded.as_bytes())
        .with_context(|| format!("Failed to write identity file {}", path.display()))?;
    tracing::info!("Generated new identity at {}", path.display());
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
        assert_eq!(first.peer_id().unwrap(), second.peer_id().unwrap());
    }

    #[test]
    fn test_corrupt_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(load_or_create(&path).is_err());
    }
}
