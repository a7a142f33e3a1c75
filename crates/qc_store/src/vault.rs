//! The master key and everything sealed under it.
//!
//! The vault is the only holder of the 32-byte master key while the app is
//! unlocked, and the only way to use it: callers never see raw key bytes,
//! they ask the vault to seal or unseal an envelope under a named info tag.
//! A locked vault fails closed with `VaultLocked`.
//!
//! At rest the master key exists solely as a [`WrappedMasterKey`] record
//! (Argon2id password wrap). `initialise` mints key + wrap on account
//! creation, `unlock` unwraps on login, and `change_password` re-wraps the
//! unchanged key under a fresh salt. Locking drops the key through
//! `Zeroizing`.

use std::sync::Arc;

use tokio::sync::RwLock;
use zeroize::Zeroizing;

use qc_crypto::aead::{self, KeyType};
use qc_crypto::kdf::{
    generate_master_key, rewrap_master_key, unwrap_master_key, wrap_master_key, WrappedMasterKey,
};

use crate::error::StoreError;

/// Shared handle; clone freely across tasks.
#[derive(Clone, Default)]
pub struct Vault {
    key: Arc<RwLock<Option<Zeroizing<[u8; 32]>>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account creation: mint a random master key, hold it unlocked, and
    /// return the wrap record the caller persists next to the account.
    pub async fn initialise(&self, password: &[u8]) -> Result<WrappedMasterKey, StoreError> {
        let master = generate_master_key();
        let wrapped = wrap_master_key(password, &master)?;
        *self.key.write().await = Some(Zeroizing::new(master.0));
        Ok(wrapped)
    }

    /// Login: unwrap the stored record with the password. A wrong password
    /// fails the AEAD tag and the vault stays locked.
    pub async fn unlock(
        &self,
        password: &[u8],
        wrapped: &WrappedMasterKey,
    ) -> Result<(), StoreError> {
        let master = unwrap_master_key(password, wrapped)?;
        *self.key.write().await = Some(Zeroizing::new(master.0));
        Ok(())
    }

    /// Unlock with key material that skipped the password path (OS keyring,
    /// re-login restore).
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        *self.key.write().await = Some(Zeroizing::new(key));
    }

    /// Zeroizes the key.
    pub async fn lock(&self) {
        *self.key.write().await = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.key.read().await.is_none()
    }

    /// Password change: the master key is unchanged, the wrap is re-derived
    /// with a fresh salt. The old password must still unwrap the old record;
    /// everything already sealed stays readable.
    pub async fn change_password(
        &self,
        old_password: &[u8],
        new_password: &[u8],
        wrapped: &WrappedMasterKey,
    ) -> Result<WrappedMasterKey, StoreError> {
        let rewrapped = rewrap_master_key(old_password, new_password, wrapped)?;
        // Whoever changes the password holds the session; keep it unlocked.
        let master = unwrap_master_key(new_password, &rewrapped)?;
        *self.key.write().await = Some(Zeroizing::new(master.0));
        Ok(rewrapped)
    }

    // ── Sealing ──────────────────────────────────────────────────────────

    /// Seal plaintext into an `mk`-type envelope under `info_tag`. Returns
    /// the opaque envelope string stored in slots and job payloads.
    pub async fn seal(&self, plaintext: &[u8], info_tag: &str) -> Result<String, StoreError> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or(StoreError::VaultLocked)?;
        let envelope = aead::seal_envelope(key, plaintext, info_tag, KeyType::Mk)?;
        Ok(aead::envelope_to_string(&envelope)?)
    }

    /// Unseal an envelope string. The caller names the info tags it accepts;
    /// a tag outside the list is rejected before any key derivation.
    pub async fn unseal(
        &self,
        sealed: &str,
        allowed_tags: &[&str],
    ) -> Result<Vec<u8>, StoreError> {
        let envelope = aead::envelope_from_string(sealed)?;
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or(StoreError::VaultLocked)?;
        let plaintext = aead::unseal_envelope(key, &envelope, allowed_tags)?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_crypto::aead::{INFO_TAG_OUTBOX_DR, INFO_TAG_SETTINGS};
    use qc_crypto::CryptoError;

    #[tokio::test]
    async fn locked_vault_fails_closed() {
        let vault = Vault::new();
        assert!(vault.is_locked().await);
        let err = vault.seal(b"x", INFO_TAG_SETTINGS).await.unwrap_err();
        assert!(matches!(err, StoreError::VaultLocked));
    }

    #[tokio::test]
    async fn initialise_unlock_cycle() {
        let vault = Vault::new();
        let wrapped = vault.initialise(b"hunter2").await.unwrap();
        assert!(!vault.is_locked().await);

        let sealed = vault.seal(b"secret", INFO_TAG_OUTBOX_DR).await.unwrap();
        vault.lock().await;
        assert!(vault.is_locked().await);

        // Wrong password leaves it locked; the right one reads old material.
        assert!(vault.unlock(b"nope", &wrapped).await.is_err());
        assert!(vault.is_locked().await);
        vault.unlock(b"hunter2", &wrapped).await.unwrap();
        let back = vault.unseal(&sealed, &[INFO_TAG_OUTBOX_DR]).await.unwrap();
        assert_eq!(back, b"secret");
    }

    #[tokio::test]
    async fn change_password_rewraps_but_old_seals_survive() {
        let vault = Vault::new();
        let wrapped = vault.initialise(b"old-pw").await.unwrap();
        let sealed = vault.seal(b"kept", INFO_TAG_SETTINGS).await.unwrap();

        let rewrapped = vault.change_password(b"old-pw", b"new-pw", &wrapped).await.unwrap();
        assert_ne!(wrapped.salt_hex, rewrapped.salt_hex, "re-wrap must use a fresh salt");

        vault.lock().await;
        assert!(vault.unlock(b"old-pw", &rewrapped).await.is_err());
        vault.unlock(b"new-pw", &rewrapped).await.unwrap();
        let back = vault.unseal(&sealed, &[INFO_TAG_SETTINGS]).await.unwrap();
        assert_eq!(back, b"kept");
    }

    #[tokio::test]
    async fn unseal_enforces_tag_allow_list() {
        let vault = Vault::new();
        vault.unlock_with_key([5u8; 32]).await;
        let sealed = vault.seal(b"x", INFO_TAG_SETTINGS).await.unwrap();
        let err = vault.unseal(&sealed, &[INFO_TAG_OUTBOX_DR]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Crypto(CryptoError::EnvelopeInfoTagMismatch { .. })
        ));
    }
}
