//! Time-boxed, revocable access tokens for private attachments.
//!
//! A token is a symmetric, bidirectional mapping held in the KV store with
//! a shared TTL: the forward entry `att:{token}` resolves to
//! `"attachmentId:principalId"`, the reverse entry
//! `att:{attachmentId}:{principalId}` resolves back to the token, so either
//! direction can be looked up and both expire together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use ring::digest;
use thiserror::Error;

use crate::kv_store::{KvError, KvStore};
use crate::storage::models::OwnerRef;
use crate::storage::{Database, DatabaseError};

/// Hex length of a SHA-256 digest embedded in each token.
const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Grants or denies a principal access to an attachment through one of its
/// owners. Implementations are registered per owner type; this is the
/// explicit stand-in for the original's policy gate and capability-method
/// checks.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, owner: &OwnerRef, principal_id: u64) -> bool;
}

/// Typed registry of access policies keyed by owner type. Registered once
/// at startup; no runtime type discovery.
#[derive(Default)]
pub struct AccessPolicyRegistry {
    policies: HashMap<String, Vec<Arc<dyn AccessPolicy>>>,
}

impl AccessPolicyRegistry {
    pub fn register(&mut self, owner_type: &str, policy: Arc<dyn AccessPolicy>) {
        self.policies
            .entry(owner_type.to_string())
            .or_default()
            .push(policy);
    }

    /// True if any policy for the owner's type grants access.
    pub fn check(&self, owner: &OwnerRef, principal_id: u64) -> bool {
        self.policies
            .get(&owner.owner_type)
            .map(|policies| policies.iter().any(|p| p.allows(owner, principal_id)))
            .unwrap_or(false)
    }
}

pub struct TokenManager {
    kv: Arc<dyn KvStore>,
    db: Database,
    ttl: Duration,
    token_length: usize,
    policies: AccessPolicyRegistry,
}

impl TokenManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        db: Database,
        ttl_seconds: u64,
        token_length: usize,
        policies: AccessPolicyRegistry,
    ) -> Self {
        Self {
            kv,
            db,
            ttl: Duration::from_secs(ttl_seconds),
            token_length,
            policies,
        }
    }

    // ========================================================================
    // Token string structure
    // ========================================================================

    /// Generate a fresh token string: a random alphanumeric string of the
    /// configured length, with the SHA-256 hex digest of that string
    /// spliced in at its midpoint. Digest letters are upper-cased on a coin
    /// flip; validation lower-cases before comparing, so the mixed case
    /// adds entropy without affecting verification.
    pub fn generate_token_str(&self) -> String {
        let mut rng = rand::thread_rng();
        let random: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(self.token_length)
            .map(char::from)
            .collect();

        let mixed: String = sha256_hex(random.as_bytes())
            .chars()
            .map(|c| {
                if c.is_ascii_alphabetic() && rng.gen_bool(0.5) {
                    c.to_ascii_uppercase()
                } else {
                    c
                }
            })
            .collect();

        let pos = self.split_pos();
        format!("{}{}{}", &random[..pos], mixed, &random[pos..])
    }

    /// Structural validation only: exact length and a digest that matches
    /// the front+back concatenation. Says nothing about whether the token
    /// is stored.
    pub fn validate_token_str(&self, token: &str) -> bool {
        if !token.is_ascii() || token.len() != self.token_length + DIGEST_HEX_LEN {
            return false;
        }
        let pos = self.split_pos();
        let front = &token[..pos];
        let embedded = token[pos..pos + DIGEST_HEX_LEN].to_ascii_lowercase();
        let back = &token[pos + DIGEST_HEX_LEN..];
        sha256_hex(format!("{front}{back}").as_bytes()) == embedded
    }

    fn split_pos(&self) -> usize {
        self.token_length.div_ceil(2)
    }

    // ========================================================================
    // Issuance and lookup
    // ========================================================================

    /// Return the existing non-expired token for the pair, or mint and
    /// store a new one.
    pub async fn obtain(
        &self,
        attachment_id: u64,
        principal_id: u64,
    ) -> Result<Option<String>, TokenError> {
        if let Some(token) = self.get_token(attachment_id, principal_id).await? {
            return Ok(Some(token));
        }
        self.create(attachment_id, principal_id).await
    }

    /// Mint a new token for the pair. Returns None if a valid token
    /// appeared concurrently.
    pub async fn create(
        &self,
        attachment_id: u64,
        principal_id: u64,
    ) -> Result<Option<String>, TokenError> {
        let token = self.generate_token_str();
        Ok(self
            .store(attachment_id, principal_id, &token)
            .await?
            .then_some(token))
    }

    /// Write the forward and reverse entries with the shared TTL. Both
    /// directions are re-checked first; returns false when a valid token
    /// already exists for either side, so a pair never accumulates
    /// duplicate tokens. Write order is forward-then-reverse: a failure in
    /// between leaves only a forward entry, which the TTL bounds.
    pub async fn store(
        &self,
        attachment_id: u64,
        principal_id: u64,
        token: &str,
    ) -> Result<bool, TokenError> {
        let (existing_att, existing_principal) = self.get(token).await?;
        if existing_att.is_some() || existing_principal.is_some() {
            return Ok(false);
        }
        if self.get_token(attachment_id, principal_id).await?.is_some() {
            return Ok(false);
        }

        let payload = format!("{attachment_id}:{principal_id}");
        self.kv.set_ex(&token_key(token), &payload, self.ttl).await?;
        self.kv
            .set_ex(&pair_key(attachment_id, principal_id), token, self.ttl)
            .await?;
        Ok(true)
    }

    /// Resolve a token to its (attachment, principal) ids. Malformed or
    /// absent entries yield `(None, None)`.
    pub async fn get(&self, token: &str) -> Result<(Option<u64>, Option<u64>), TokenError> {
        let Some(payload) = self.kv.get(&token_key(token)).await? else {
            return Ok((None, None));
        };
        let Some((att, principal)) = payload.split_once(':') else {
            return Ok((None, None));
        };
        Ok((att.parse().ok(), principal.parse().ok()))
    }

    /// Current token for a pair, if any.
    pub async fn get_token(
        &self,
        attachment_id: u64,
        principal_id: u64,
    ) -> Result<Option<String>, TokenError> {
        Ok(self.kv.get(&pair_key(attachment_id, principal_id)).await?)
    }

    pub async fn has(&self, attachment_id: u64, principal_id: u64) -> Result<bool, TokenError> {
        Ok(self.get_token(attachment_id, principal_id).await?.is_some())
    }

    /// Reset the TTL on both entries if the token currently resolves.
    pub async fn refresh(&self, token: &str) -> Result<bool, TokenError> {
        let (attachment_id, principal_id) = self.get(token).await?;
        if let (Some(attachment_id), Some(principal_id)) = (attachment_id, principal_id) {
            self.kv.expire(&token_key(token), self.ttl).await?;
            self.kv
                .expire(&pair_key(attachment_id, principal_id), self.ttl)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    // ========================================================================
    // Revocation
    // ========================================================================

    /// Destroy tokens by attachment and/or principal.
    ///
    /// Both given: delete the pair's two entries. Attachment only: scan the
    /// reverse keys and delete each forward+reverse pair. Principal only:
    /// bulk-delete the reverse keys; forward entries are left to expire
    /// with their TTL (a bounded, accepted leak).
    pub async fn destroy(
        &self,
        attachment_id: Option<u64>,
        principal_id: Option<u64>,
    ) -> Result<(), TokenError> {
        match (attachment_id, principal_id) {
            (Some(attachment_id), Some(principal_id)) => {
                if let Some(token) = self.get_token(attachment_id, principal_id).await? {
                    // Reverse first so a failure in between cannot leave a
                    // resolvable reverse entry pointing at a dead token.
                    self.kv
                        .del(&[pair_key(attachment_id, principal_id), token_key(&token)])
                        .await?;
                }
            }
            (Some(attachment_id), None) => {
                let keys = self
                    .kv
                    .keys(&format!("att:{attachment_id}:*"))
                    .await?;
                if keys.is_empty() {
                    return Ok(());
                }
                for token in self.kv.mget(&keys).await?.into_iter().flatten() {
                    self.destroy_str(&token).await?;
                }
            }
            (None, Some(principal_id)) => {
                let keys = self.kv.keys(&format!("att:*:{principal_id}")).await?;
                if !keys.is_empty() {
                    self.kv.del(&keys).await?;
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Destroy a token by its string representation.
    pub async fn destroy_str(&self, token: &str) -> Result<(), TokenError> {
        let (attachment_id, principal_id) = self.get(token).await?;
        if let (Some(attachment_id), Some(principal_id)) = (attachment_id, principal_id) {
            self.kv
                .del(&[pair_key(attachment_id, principal_id), token_key(token)])
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Access decision
    // ========================================================================

    /// Whether a principal may download a private attachment: any owner
    /// currently referencing it must have a policy that grants access. No
    /// referencing owner means no access (fail closed).
    pub async fn can_download(
        &self,
        attachment_id: u64,
        principal_id: u64,
    ) -> Result<bool, TokenError> {
        let owners = self.db.owners_of(attachment_id)?;
        Ok(owners
            .iter()
            .any(|owner| self.policies.check(owner, principal_id)))
    }
}

fn token_key(token: &str) -> String {
    format!("att:{token}")
}

fn pair_key(attachment_id: u64, principal_id: u64) -> String {
    format!("att:{attachment_id}:{principal_id}")
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, data))
}
