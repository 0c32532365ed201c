//! File-backed key material for local actors
//!
//! The store records only the public key path per key id; the private key
//! sits next to it with `public.pem` swapped for `private.pem`.

use std::path::PathBuf;
use std::sync::Arc;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::data::{Actor, FederationStore, PublicKey};
use crate::error::AppError;

pub struct KeyStore {
    store: Arc<dyn FederationStore>,
    key_directory: PathBuf,
    key_bits: usize,
}

impl KeyStore {
    pub fn new(store: Arc<dyn FederationStore>, key_directory: PathBuf, key_bits: usize) -> Self {
        Self {
            store,
            key_directory,
            key_bits,
        }
    }

    /// Private key used to sign on behalf of `actor`.
    ///
    /// # Errors
    /// `AppError::MissingKey` when no key file is recorded or it cannot be
    /// read. The actor can still receive; it just cannot sign.
    pub async fn private_key_for(&self, actor: &Actor) -> Result<RsaPrivateKey, AppError> {
        let Some(key_id) = actor.public_key_id() else {
            return Err(missing_key(actor, "actor publishes no key id"));
        };

        let Some(public_file) = self.store.get_key_file(key_id).await? else {
            return Err(missing_key(actor, "no key file recorded"));
        };

        let private_file = public_file.replace("public.pem", "private.pem");
        let pem = match tokio::fs::read_to_string(&private_file).await {
            Ok(pem) => pem,
            Err(e) => {
                tracing::debug!(file = %private_file, error = %e, "Private key unreadable");
                return Err(missing_key(actor, "private key file unreadable"));
            }
        };

        RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|_| missing_key(actor, "private key file is not a PEM RSA key"))
    }

    /// Generate a key pair for a local actor and publish its public half.
    pub async fn provision(&self, actor: &mut Actor) -> Result<(), AppError> {
        let bits = self.key_bits;
        let private_key = tokio::task::spawn_blocking(move || {
            let mut rng = rand::thread_rng();
            RsaPrivateKey::new(&mut rng, bits)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(|e| AppError::Internal(anyhow::anyhow!("RSA key generation failed: {e}")))?;

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("encode private key: {e}")))?;
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("encode public key: {e}")))?;

        tokio::fs::create_dir_all(&self.key_directory)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        let name = &actor.preferred_username;
        let private_path = self.key_directory.join(format!("{name}-private.pem"));
        let public_path = self.key_directory.join(format!("{name}-public.pem"));

        tokio::fs::write(&private_path, private_pem.as_bytes())
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
        tokio::fs::write(&public_path, public_pem.as_bytes())
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        let key_id = actor
            .public_key_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}#main-key", actor.id));

        actor.public_key = Some(PublicKey {
            id: key_id.clone(),
            owner: actor.id.clone(),
            public_key_pem: public_pem,
        });

        self.store
            .insert_key_file(&key_id, &actor.id, &public_path.to_string_lossy())
            .await?;

        tracing::info!(actor = %actor.id, file = %public_path.display(), "Provisioned key pair");
        Ok(())
    }
}

fn missing_key(actor: &Actor, detail: &str) -> AppError {
    tracing::error!(
        actor = %actor.id,
        detail,
        "Cannot sign outgoing activities: private key missing. Regenerate the key \
         pair for this actor, then ask federated instances to refresh the public key \
         they hold for it. Until then the actor can receive but not send."
    );
    AppError::MissingKey(actor.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use tempfile::TempDir;

    async fn key_store() -> (KeyStore, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let keys = KeyStore::new(db.clone(), temp_dir.path().join("keys"), 1024);
        (keys, db, temp_dir)
    }

    #[tokio::test]
    async fn provisioned_key_can_be_loaded() {
        let (keys, db, _temp_dir) = key_store().await;
        let mut board = Actor::new_board("https://chan.example", "g", "Technology", "");

        keys.provision(&mut board).await.unwrap();
        db.insert_actor(&board).await.unwrap();

        let pem = &board.public_key.as_ref().unwrap().public_key_pem;
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let private_key = keys.private_key_for(&board).await.unwrap();
        let public_key = crate::federation::signature::parse_public_key(pem).unwrap();
        assert_eq!(RsaPublicKey::from(&private_key), public_key);
    }

    #[tokio::test]
    async fn missing_key_file_is_reported() {
        let (keys, _db, _temp_dir) = key_store().await;
        let board = Actor::new_board("https://chan.example", "g", "Technology", "");

        let error = keys.private_key_for(&board).await.unwrap_err();
        assert!(matches!(error, AppError::MissingKey(id) if id == "https://chan.example/g"));
    }

    #[tokio::test]
    async fn deleted_private_key_is_reported() {
        let (keys, _db, temp_dir) = key_store().await;
        let mut board = Actor::new_board("https://chan.example", "g", "Technology", "");
        keys.provision(&mut board).await.unwrap();

        std::fs::remove_file(temp_dir.path().join("keys").join("g-private.pem")).unwrap();

        assert!(matches!(
            keys.private_key_for(&board).await,
            Err(AppError::MissingKey(_))
        ));
    }

    #[tokio::test]
    async fn pkcs1_private_key_is_accepted() {
        let (keys, db, temp_dir) = key_store().await;
        let board = Actor::new_board("https://chan.example", "v", "Video Games", "");

        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let dir = temp_dir.path().join("legacy");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("v-private.pem"),
            private_key.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();
        db.insert_key_file(
            board.public_key_id().unwrap(),
            &board.id,
            &dir.join("v-public.pem").to_string_lossy(),
        )
        .await
        .unwrap();

        assert_eq!(keys.private_key_for(&board).await.unwrap(), private_key);
    }
}
