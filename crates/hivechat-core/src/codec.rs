//! Memo encoding through an external key holder
//!
//! Private keys never enter this crate. Encrypted memos (ASCII strings that
//! start with `#`) are handed to a [`KeyHolder`], typically a wallet
//! extension, which returns the plaintext. Unprefixed memos are already
//! plaintext and pass through untouched.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::DecryptFailure;

/// Leading character of an encrypted memo
pub const ENCRYPTED_SENTINEL: char = '#';

/// Whether a memo is encrypted.
pub fn is_encrypted(payload: &str) -> bool {
    payload.starts_with(ENCRYPTED_SENTINEL)
}

/// Holder of the user's memo key.
#[async_trait]
pub trait KeyHolder: Send + Sync {
    /// Decrypt `memo` with `username`'s memo key.
    async fn request_decrypt(&self, username: &str, memo: &str) -> Result<String, DecryptFailure>;

    /// Encrypt `plaintext` from `username` to `recipient`.
    async fn request_encrypt(
        &self,
        username: &str,
        recipient: &str,
        plaintext: &str,
    ) -> Result<String, DecryptFailure>;
}

/// Decrypt/encrypt front end with sentinel detection and a response timeout.
#[derive(Clone)]
pub struct MemoCodec {
    key_holder: Arc<dyn KeyHolder>,
    timeout: Duration,
}

impl MemoCodec {
    pub fn new(key_holder: Arc<dyn KeyHolder>, timeout: Duration) -> Self {
        Self {
            key_holder,
            timeout,
        }
    }

    /// Resolve a payload to plaintext for `viewer`.
    pub async fn decrypt(&self, payload: &str, viewer: &str) -> Result<String, DecryptFailure> {
        if !is_encrypted(payload) {
            return Ok(payload.to_string());
        }
        if payload.len() == 1 {
            return Err(DecryptFailure::MalformedPayload("empty ciphertext".into()));
        }

        let plaintext = match tokio::time::timeout(
            self.timeout,
            self.key_holder.request_decrypt(viewer, payload),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(viewer, timeout = ?self.timeout, "Key holder did not answer");
                return Err(DecryptFailure::KeyHolderUnavailable);
            }
        };

        // Wallets hand back the plaintext with the sentinel still attached.
        let plaintext = plaintext
            .strip_prefix(ENCRYPTED_SENTINEL)
            .map(str::to_string)
            .unwrap_or(plaintext);
        debug!(viewer, len = plaintext.len(), "Memo decrypted");
        Ok(plaintext)
    }

    /// Encrypt `plaintext` from `viewer` to `recipient`.
    pub async fn encrypt(
        &self,
        viewer: &str,
        recipient: &str,
        plaintext: &str,
    ) -> Result<String, DecryptFailure> {
        let memo = match tokio::time::timeout(
            self.timeout,
            self.key_holder.request_encrypt(viewer, recipient, plaintext),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(DecryptFailure::KeyHolderUnavailable),
        };
        if !is_encrypted(&memo) {
            return Err(DecryptFailure::MalformedPayload(
                "key holder returned an unprefixed memo".into(),
            ));
        }
        Ok(memo)
    }
}

/// Reversible stand-in for a wallet.
///
/// Encodes `sender|recipient|plaintext` as hex behind the sentinel. It
/// performs no cryptography; it exists so the pipeline can be exercised
/// without a wallet (tests, replay files, demos).
pub struct LoopbackKeyHolder {
    /// Accounts whose keys this holder "has"
    accounts: RwLock<HashSet<String>>,
    online: AtomicBool,
    delay: RwLock<Option<Duration>>,
    decrypt_calls: AtomicUsize,
}

impl LoopbackKeyHolder {
    pub fn new<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|a| a.as_ref().to_ascii_lowercase())
                    .collect(),
            ),
            online: AtomicBool::new(true),
            delay: RwLock::new(None),
            decrypt_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_account(&self, username: &str) {
        self.accounts.write().insert(username.to_ascii_lowercase());
    }

    /// Simulate the wallet being closed or reopened.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delay every answer, to exercise the codec timeout.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    /// Encode without going through a holder instance.
    pub fn seal(sender: &str, recipient: &str, plaintext: &str) -> String {
        format!(
            "{}{}",
            ENCRYPTED_SENTINEL,
            hex::encode(format!(
                "{}|{}|{}",
                sender.to_ascii_lowercase(),
                recipient.to_ascii_lowercase(),
                plaintext
            ))
        )
    }

    async fn gate(&self, username: &str) -> Result<(), DecryptFailure> {
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(DecryptFailure::KeyHolderUnavailable);
        }
        if !self.accounts.read().contains(&username.to_ascii_lowercase()) {
            return Err(DecryptFailure::WrongKey);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyHolder for LoopbackKeyHolder {
    async fn request_decrypt(&self, username: &str, memo: &str) -> Result<String, DecryptFailure> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(username).await?;

        let body = memo.strip_prefix(ENCRYPTED_SENTINEL).unwrap_or(memo);
        let bytes = hex::decode(body)
            .map_err(|e| DecryptFailure::MalformedPayload(format!("not hex: {}", e)))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| DecryptFailure::MalformedPayload("not utf-8".into()))?;

        let mut parts = text.splitn(3, '|');
        let (Some(sender), Some(recipient), Some(plaintext)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(DecryptFailure::MalformedPayload("missing header".into()));
        };
        let username = username.to_ascii_lowercase();
        if username != sender && username != recipient {
            return Err(DecryptFailure::WrongKey);
        }
        Ok(format!("{}{}", ENCRYPTED_SENTINEL, plaintext))
    }

    async fn request_encrypt(
        &self,
        username: &str,
        recipient: &str,
        plaintext: &str,
    ) -> Result<String, DecryptFailure> {
        self.gate(username).await?;
        Ok(Self::seal(username, recipient, plaintext))
    }
}
