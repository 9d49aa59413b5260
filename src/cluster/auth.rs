// API-key registry and bearer-token lifecycle

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::cluster::current_time_millis;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenEntry {
    expires_at_ms: i64,
    api_key: String,
}

#[derive(Debug, Default)]
struct AuthState {
    /// api key -> role
    api_keys: HashMap<String, String>,
    tokens: HashMap<String, TokenEntry>,
}

/// Token-issuing authentication service. Tokens are opaque hex strings minted
/// under a per-process secret and expire after `token_ttl`.
#[derive(Debug)]
pub struct AuthManager {
    secret: String,
    config: AuthConfig,
    state: RwLock<AuthState>,
}

impl AuthManager {
    /// Create the service; a missing secret is generated at startup.
    pub fn new(secret: Option<String>, config: AuthConfig) -> Self {
        let secret = secret.unwrap_or_else(|| {
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        });
        Self {
            secret,
            config,
            state: RwLock::new(AuthState::default()),
        }
    }

    pub async fn add_api_key(&self, api_key: &str, role: &str) {
        let mut state = self.state.write().await;
        state.api_keys.insert(api_key.to_string(), role.to_string());
        info!("Added API key with role {}", role);
    }

    /// Exchange an API key for a bearer token.
    #[instrument(skip(self, api_key))]
    pub async fn authenticate(&self, api_key: &str) -> AppResult<String> {
        let mut state = self.state.write().await;
        if !state.api_keys.contains_key(api_key) {
            return Err(AppError::InvalidApiKey);
        }

        let token = self.mint_token()?;
        state.tokens.insert(
            token.clone(),
            TokenEntry {
                expires_at_ms: current_time_millis()
                    + self.config.token_ttl.as_millis() as i64,
                api_key: api_key.to_string(),
            },
        );
        Ok(token)
    }

    /// Accept a token iff it is known and unexpired. Expired tokens are
    /// evicted on sight.
    pub async fn validate_token(&self, token: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        let expires_at_ms = match state.tokens.get(token) {
            Some(entry) => entry.expires_at_ms,
            None => return Err(AppError::InvalidToken),
        };
        if current_time_millis() >= expires_at_ms {
            state.tokens.remove(token);
            return Err(AppError::TokenExpired);
        }
        Ok(())
    }

    /// Role of the API key behind a live token.
    pub async fn role_of(&self, token: &str) -> Option<String> {
        let state = self.state.read().await;
        let entry = state.tokens.get(token)?;
        state.api_keys.get(&entry.api_key).cloned()
    }

    /// Drop every expired token; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut state = self.state.write().await;
        let now = current_time_millis();
        let before = state.tokens.len();
        state.tokens.retain(|_, entry| entry.expires_at_ms > now);
        let removed = before - state.tokens.len();
        if removed > 0 {
            info!("Cleaned up {} expired tokens", removed);
        }
        removed
    }

    /// Periodic token sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let auth = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(auth.config.sweep_interval);
            loop {
                ticker.tick().await;
                auth.sweep().await;
            }
        });
    }

    /// 32 random bytes plus the current timestamp, MACed under the process
    /// secret and hex-encoded.
    fn mint_token(&self) -> AppResult<String> {
        let mut random_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut random_bytes);

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AppError::Internal(format!("Failed to initialize HMAC: {}", e)))?;
        mac.update(&random_bytes);
        mac.update(current_time_millis().to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
