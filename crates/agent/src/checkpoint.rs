//! Signed checkpoint tokens.
//!
//! A token is `wp1.<payload>.<signature>`: the payload is the base64url JSON
//! of a [`TokenPayload`] and the signature is an HMAC-SHA256 over the
//! `wp1.<payload>` text, keyed with the run config's secret. Anyone holding
//! the token and an equivalent config can resume the run; nobody without the
//! secret can forge or alter one.
//!
//! Decoding checks, in order: structure and signature (reported together as
//! [`TokenError::InvalidSignature`]), version, config fingerprint, expiry.
//! Nothing inside the payload is trusted before the signature verifies.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::machine::{ReasoningState, TerminationReason};

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VERSION: u32 = 1;
const VERSION_TAG: &str = "wp1";
const ISSUER: &str = "waypoint";

/// Identifiers a token carries alongside the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub run_id: String,
    pub request_id: String,
}

impl RunIdentity {
    pub fn new(run_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            request_id: request_id.into(),
        }
    }

    /// Fresh random identifiers.
    pub fn generate() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            uuid::Uuid::new_v4().to_string(),
        )
    }
}

/// The decoded content of a checkpoint token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub version: u32,
    pub issuer: String,
    pub run_id: String,
    pub request_id: String,
    pub state: ReasoningState,
    pub fingerprint: String,
    pub issued_at_ms: i64,
    pub expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl TokenPayload {
    pub fn identity(&self) -> RunIdentity {
        RunIdentity::new(&self.run_id, &self.request_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.termination_reason == Some(TerminationReason::Cancelled)
    }
}

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("invalid_token_signature: token is malformed or was not signed with this secret")]
    InvalidSignature,

    #[error("token_config_mismatch: token was issued for a different model, tool set or system prompt")]
    ConfigMismatch,

    #[error("token_expired: token expired at {expires_at_ms}")]
    Expired { expires_at_ms: i64 },

    #[error("unsupported_token_version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid_token_payload: {0}")]
    Payload(String),

    #[error("missing_token_secret: the run config has an empty signing secret")]
    MissingSecret,
}

impl TokenError {
    /// Stable wire name of the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_token_signature",
            Self::ConfigMismatch => "token_config_mismatch",
            Self::Expired { .. } => "token_expired",
            Self::UnsupportedVersion(_) => "unsupported_token_version",
            Self::Payload(_) => "invalid_token_payload",
            Self::MissingSecret => "missing_token_secret",
        }
    }
}

/// Issue a token for `state` under `config`.
pub fn issue(
    state: &ReasoningState,
    config: &RunConfig,
    identity: &RunIdentity,
) -> Result<String, TokenError> {
    issue_at(state, config, identity, crate::now_ms())
}

/// Issue a token as of `now_ms`.
pub fn issue_at(
    state: &ReasoningState,
    config: &RunConfig,
    identity: &RunIdentity,
    now_ms: i64,
) -> Result<String, TokenError> {
    let payload = build_payload(state, config, identity, now_ms, None);
    encode(&payload, &config.token_secret)
}

/// Issue a token recording that the run was cancelled for `reason`.
pub(crate) fn issue_cancelled(
    state: &ReasoningState,
    config: &RunConfig,
    identity: &RunIdentity,
    reason: &str,
) -> Result<String, TokenError> {
    let payload = build_payload(state, config, identity, crate::now_ms(), Some(reason.to_string()));
    encode(&payload, &config.token_secret)
}

/// Verify and decode a token against `config`.
pub fn decode(token: &str, config: &RunConfig) -> Result<TokenPayload, TokenError> {
    decode_at(token, config, crate::now_ms())
}

/// Verify and decode a token as of `now_ms`.
pub fn decode_at(token: &str, config: &RunConfig, now_ms: i64) -> Result<TokenPayload, TokenError> {
    let result = verify(token, config, now_ms);
    if let Err(e) = &result {
        warn!(kind = e.kind(), "Rejected checkpoint token");
    }
    result
}

/// Mark the run behind `token` as cancelled and re-issue it.
///
/// A non-terminal state is moved to `completed`; the live runner is not
/// involved.
pub fn mark_cancelled(token: &str, config: &RunConfig, reason: &str) -> Result<String, TokenError> {
    let payload = decode(token, config)?;
    let mut state = payload.state;
    state.termination_reason = Some(TerminationReason::Cancelled);
    if !state.status.is_terminal() {
        state.status = crate::machine::Status::Completed;
    }
    debug!(run_id = %payload.run_id, reason, "Marking checkpoint cancelled");

    let identity = RunIdentity::new(payload.run_id, payload.request_id);
    issue_cancelled(&state, config, &identity, reason)
}

fn build_payload(
    state: &ReasoningState,
    config: &RunConfig,
    identity: &RunIdentity,
    now_ms: i64,
    cancel_reason: Option<String>,
) -> TokenPayload {
    TokenPayload {
        version: TOKEN_VERSION,
        issuer: ISSUER.into(),
        run_id: identity.run_id.clone(),
        request_id: identity.request_id.clone(),
        state: state.clone(),
        fingerprint: config.fingerprint(),
        issued_at_ms: now_ms,
        expires_at_ms: config
            .token_ttl_ms
            .map(|ttl| now_ms.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX))),
        cancel_reason,
    }
}

fn mac_for(secret: &[u8]) -> Result<HmacSha256, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::MissingSecret);
    }
    HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidSignature)
}

fn encode(payload: &TokenPayload, secret: &[u8]) -> Result<String, TokenError> {
    let json = serde_json::to_vec(payload).map_err(|e| TokenError::Payload(e.to_string()))?;
    sign(VERSION_TAG, &URL_SAFE_NO_PAD.encode(json), secret)
}

fn sign(tag: &str, encoded_payload: &str, secret: &[u8]) -> Result<String, TokenError> {
    let signed = format!("{tag}.{encoded_payload}");
    let mut mac = mac_for(secret)?;
    mac.update(signed.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{signed}.{signature}"))
}

fn verify(token: &str, config: &RunConfig, now_ms: i64) -> Result<TokenPayload, TokenError> {
    let (signed, signature) = token.rsplit_once('.').ok_or(TokenError::InvalidSignature)?;
    let (tag, encoded_payload) = signed.split_once('.').ok_or(TokenError::InvalidSignature)?;
    if encoded_payload.contains('.') {
        return Err(TokenError::InvalidSignature);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::InvalidSignature)?;
    let mut mac = mac_for(&config.token_secret)?;
    mac.update(signed.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    if tag != VERSION_TAG {
        return Err(TokenError::UnsupportedVersion(tag.to_string()));
    }
    let json = URL_SAFE_NO_PAD
        .decode(encoded_payload)
        .map_err(|_| TokenError::InvalidSignature)?;
    let payload: TokenPayload =
        serde_json::from_slice(&json).map_err(|e| TokenError::Payload(e.to_string()))?;
    if payload.version != TOKEN_VERSION {
        return Err(TokenError::UnsupportedVersion(payload.version.to_string()));
    }

    if payload.fingerprint != config.fingerprint() {
        return Err(TokenError::ConfigMismatch);
    }
    if let Some(expires_at_ms) = payload.expires_at_ms {
        if now_ms > expires_at_ms {
            return Err(TokenError::Expired { expires_at_ms });
        }
    }
    Ok(payload)
}
