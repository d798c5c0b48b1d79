//! Bearer tokens issued by pairing.
//!
//! Only SHA-256 digests are kept. Verification hashes the presented value and
//! compares it against every stored digest in constant time, without stopping
//! at the first match.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::RwLock,
};

use {
    base64::Engine,
    bambooclaw_common::{AuthContext, TokenScope},
    chrono::{DateTime, Duration, Utc},
    rand::{TryRngCore, rngs::OsRng},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    subtle::ConstantTimeEq,
    tracing::{debug, info, warn},
};

use crate::error::{AuthError, PairingError};

/// Length of the digest prefix used as a public token identifier.
const TOKEN_ID_LEN: usize = 12;

/// A freshly issued token. The raw value exists only here, once.
pub struct PairingToken {
    token: Secret<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: TokenScope,
}

impl PairingToken {
    /// The bearer value to hand to the client.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }

    /// Public identifier (digest prefix), safe to log.
    #[must_use]
    pub fn token_id(&self) -> String {
        token_id(&sha256_hex(self.expose()))
    }
}

impl fmt::Debug for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingToken")
            .field("token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    digest: String,
    scope: TokenScope,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    revoked: bool,
}

impl TokenRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Digest-keyed token table. Verification takes the read lock, issue and
/// revoke take the write lock.
pub struct TokenStore {
    records: RwLock<HashMap<String, TokenRecord>>,
    ttl: Option<Duration>,
    persist_path: Option<PathBuf>,
}

impl TokenStore {
    /// In-memory store. `ttl` of `None` issues non-expiring tokens.
    #[must_use]
    pub fn new(ttl: Option<std::time::Duration>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl: ttl.and_then(|d| Duration::from_std(d).ok()),
            persist_path: None,
        }
    }

    /// Store that mirrors digests to `path`, loading any existing entries.
    /// A corrupt file is logged and ignored.
    #[must_use]
    pub fn persistent(ttl: Option<std::time::Duration>, path: PathBuf) -> Self {
        let store = Self {
            persist_path: Some(path.clone()),
            ..Self::new(ttl)
        };
        match load_records(&path) {
            Ok(records) => {
                debug!(path = %path.display(), count = records.len(), "loaded token digests");
                let mut table = store.write();
                for record in records {
                    table.insert(record.digest.clone(), record);
                }
            },
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable token file"),
        }
        store
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TokenRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TokenRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a new token with `scope`. Fails only if the OS RNG fails.
    pub fn issue(&self, scope: TokenScope) -> Result<PairingToken, PairingError> {
        let raw = generate_token()?;
        let digest = sha256_hex(&raw);
        let issued_at = Utc::now();
        let expires_at = self.ttl.map(|ttl| issued_at + ttl);

        let record = TokenRecord {
            digest: digest.clone(),
            scope,
            issued_at,
            expires_at,
            revoked: false,
        };
        {
            let mut table = self.write();
            table.insert(digest.clone(), record);
            self.persist(&table);
        }
        info!(token_id = %token_id(&digest), %scope, "issued token");

        Ok(PairingToken {
            token: Secret::new(raw),
            issued_at,
            expires_at,
            scope,
        })
    }

    /// Verify a presented bearer value against `required`.
    pub fn verify(
        &self,
        presented: Option<&str>,
        required: TokenScope,
    ) -> Result<AuthContext, AuthError> {
        self.verify_at(presented, required, Utc::now())
    }

    fn verify_at(
        &self,
        presented: Option<&str>,
        required: TokenScope,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, AuthError> {
        let presented = presented.map(str::trim).filter(|t| !t.is_empty());
        let Some(presented) = presented else {
            return Err(AuthError::Missing);
        };
        let digest = sha256_hex(presented);

        let table = self.read();
        let mut matched: Option<&TokenRecord> = None;
        for record in table.values() {
            let equal = record.digest.as_bytes().ct_eq(digest.as_bytes());
            if bool::from(equal) {
                matched = Some(record);
            }
        }

        let record = matched.ok_or(AuthError::Invalid)?;
        if record.revoked {
            return Err(AuthError::Revoked);
        }
        if record.is_expired(now) {
            return Err(AuthError::Expired);
        }
        if !record.scope.covers(required) {
            return Err(AuthError::ScopeMismatch);
        }
        Ok(AuthContext::Token {
            token_id: token_id(&record.digest),
            scope: record.scope,
        })
    }

    /// Revoke one token. Returns `false` if it was unknown.
    pub fn revoke(&self, presented: &str) -> bool {
        let digest = sha256_hex(presented.trim());
        let mut table = self.write();
        let Some(record) = table.get_mut(&digest) else {
            return false;
        };
        record.revoked = true;
        self.persist(&table);
        info!(token_id = %token_id(&digest), "revoked token");
        true
    }

    /// Revoke every token. Returns how many were newly revoked.
    pub fn revoke_all(&self) -> usize {
        let mut table = self.write();
        let mut count = 0;
        for record in table.values_mut().filter(|r| !r.revoked) {
            record.revoked = true;
            count += 1;
        }
        self.persist(&table);
        info!(count, "revoked all tokens");
        count
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut table = self.write();
        let before = table.len();
        table.retain(|_, r| !r.is_expired(now));
        let removed = before - table.len();
        if removed > 0 {
            self.persist(&table);
            debug!(removed, "purged expired tokens");
        }
        removed
    }

    /// Tokens that would currently verify.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.read()
            .values()
            .filter(|r| !r.revoked && !r.is_expired(now))
            .count()
    }

    fn persist(&self, table: &HashMap<String, TokenRecord>) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let mut records: Vec<&TokenRecord> = table.values().collect();
        records.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        if let Err(e) = write_atomic(path, &records) {
            warn!(path = %path.display(), error = %e, "failed to persist token digests");
        }
    }
}

fn load_records(path: &Path) -> std::io::Result<Vec<TokenRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(std::io::Error::other)
}

fn write_atomic(path: &Path, records: &[&TokenRecord]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(records).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// 32 random bytes from the OS RNG, base64url without padding.
fn generate_token() -> Result<String, PairingError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| PairingError::Entropy(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

pub(crate) fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn token_id(digest: &str) -> String {
    digest.chars().take(TOKEN_ID_LEN).collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_is_32_bytes_base64url() {
        let store = TokenStore::new(None);
        let token = store.issue(TokenScope::Webhook).unwrap();
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.expose())
            .unwrap();
        assert_eq!(decoded.len(), 32);
        assert!(token.expires_at.is_none());
    }

    #[test]
    fn verify_round_trip_and_failures() {
        let store = TokenStore::new(None);
        let token = store.issue(TokenScope::Webhook).unwrap();

        let ctx = store
            .verify(Some(token.expose()), TokenScope::Webhook)
            .unwrap();
        assert!(matches!(ctx, AuthContext::Token { scope: TokenScope::Webhook, .. }));

        assert_eq!(
            store.verify(None, TokenScope::Webhook),
            Err(AuthError::Missing)
        );
        assert_eq!(
            store.verify(Some("  "), TokenScope::Webhook),
            Err(AuthError::Missing)
        );
        assert_eq!(
            store.verify(Some("not-a-token"), TokenScope::Webhook),
            Err(AuthError::Invalid)
        );
        assert_eq!(
            store.verify(Some(token.expose()), TokenScope::Admin),
            Err(AuthError::ScopeMismatch)
        );
    }

    #[test]
    fn revoked_token_fails_after_prior_success() {
        let store = TokenStore::new(None);
        let token = store.issue(TokenScope::Admin).unwrap();
        assert!(store.verify(Some(token.expose()), TokenScope::Admin).is_ok());

        assert!(store.revoke(token.expose()));
        for _ in 0..3 {
            assert_eq!(
                store.verify(Some(token.expose()), TokenScope::Admin),
                Err(AuthError::Revoked)
            );
        }
        assert!(!store.revoke("unknown"));
    }

    #[test]
    fn expired_token_fails_after_prior_success() {
        let store = TokenStore::new(Some(std::time::Duration::from_secs(60)));
        let token = store.issue(TokenScope::Webhook).unwrap();
        let expires = token.expires_at.unwrap();

        assert!(
            store
                .verify_at(Some(token.expose()), TokenScope::Webhook, expires - Duration::seconds(1))
                .is_ok()
        );
        assert_eq!(
            store.verify_at(Some(token.expose()), TokenScope::Webhook, expires),
            Err(AuthError::Expired)
        );
        assert_eq!(
            store.verify_at(
                Some(token.expose()),
                TokenScope::Webhook,
                expires + Duration::hours(1)
            ),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn revoke_all_and_purge() {
        let store = TokenStore::new(Some(std::time::Duration::from_secs(3600)));
        let a = store.issue(TokenScope::Webhook).unwrap();
        let _b = store.issue(TokenScope::Webhook).unwrap();
        assert_eq!(store.active_count(), 2);
        assert_eq!(store.revoke_all(), 2);
        assert_eq!(store.active_count(), 0);
        assert_eq!(
            store.verify(Some(a.expose()), TokenScope::Webhook),
            Err(AuthError::Revoked)
        );
        assert_eq!(store.purge_expired(), 0);
    }

    #[test]
    fn debug_never_shows_token() {
        let store = TokenStore::new(None);
        let token = store.issue(TokenScope::Webhook).unwrap();
        let dbg = format!("{token:?}");
        assert!(!dbg.contains(token.expose()));
    }

    #[test]
    fn persistent_store_survives_restart_without_raw_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let raw = {
            let store = TokenStore::persistent(None, path.clone());
            store.issue(TokenScope::Webhook).unwrap().expose().to_string()
        };
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains(&raw));

        let reopened = TokenStore::persistent(None, path);
        assert!(reopened.verify(Some(&raw), TokenScope::Webhook).is_ok());
    }
}
