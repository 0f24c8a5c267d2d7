use crate::domain::model::{Token, TokenScope};
use crate::domain::ports::TokenFetcher;
use crate::utils::error::{EtlError, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// 單一 scope 的 token 快取狀態
struct ScopeSlot {
    static_token: Option<String>,
    cached: Mutex<Option<Token>>,
}

impl ScopeSlot {
    fn new(static_token: Option<String>) -> Self {
        Self {
            static_token: static_token.filter(|t| !t.trim().is_empty()),
            cached: Mutex::new(None),
        }
    }
}

/// 管理讀寫兩種 scope 的 token 生命週期。
///
/// 每個 scope 同時只會有一個 refresh 在進行：第一個呼叫者持鎖刷新，
/// 其餘呼叫者等待並直接取用新 token。設定了靜態 token 的 scope 完全
/// 略過快取與過期檢查。
pub struct TokenManager {
    fetcher: Arc<dyn TokenFetcher>,
    read: ScopeSlot,
    write: ScopeSlot,
    refresh_margin: Duration,
}

impl TokenManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self {
            fetcher,
            read: ScopeSlot::new(None),
            write: ScopeSlot::new(None),
            refresh_margin: Duration::zero(),
        }
    }

    pub fn with_static_token(mut self, scope: TokenScope, token: Option<String>) -> Self {
        match scope {
            TokenScope::Read => self.read = ScopeSlot::new(token),
            TokenScope::Write => self.write = ScopeSlot::new(token),
        }
        self
    }

    /// 提前於伺服器 TTL 前視為過期的秒數
    pub fn with_refresh_margin(mut self, seconds: i64) -> Self {
        self.refresh_margin = Duration::try_seconds(seconds.max(0)).unwrap_or(Duration::MAX);
        self
    }

    fn slot(&self, scope: TokenScope) -> &ScopeSlot {
        match scope {
            TokenScope::Read => &self.read,
            TokenScope::Write => &self.write,
        }
    }

    /// 計算新 token 的到期時間。
    ///
    /// 提前量最多取 TTL 的一半，剛取得的 token 必定仍在有效期內；
    /// TTL 非正數或超出時間範圍時視為認證失敗。
    fn expiry_for(&self, scope: TokenScope, ttl_seconds: i64) -> Result<DateTime<Utc>> {
        let invalid = |reason: &str| EtlError::AuthError {
            scope: scope.to_string(),
            message: format!("Token endpoint returned expire={}: {}", ttl_seconds, reason),
        };

        if ttl_seconds <= 0 {
            return Err(invalid("lifetime must be positive"));
        }
        let ttl = Duration::try_seconds(ttl_seconds).ok_or_else(|| invalid("lifetime out of range"))?;
        let margin = self.refresh_margin.min(ttl / 2);

        let now = Utc::now();
        now.checked_add_signed(ttl - margin)
            .filter(|expiry| *expiry > now)
            .ok_or_else(|| invalid("lifetime out of range"))
    }

    pub async fn acquire(&self, scope: TokenScope) -> Result<Token> {
        let slot = self.slot(scope);

        if let Some(value) = &slot.static_token {
            return Ok(Token {
                value: value.clone(),
                scope,
                expires_at: None,
            });
        }

        let mut cached = slot.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid() {
                return Ok(token.clone());
            }
            tracing::info!("🔑 Cached {} token expired, refreshing", scope);
        }

        let issued = self.fetcher.fetch_token(scope).await.map_err(|e| match e {
            EtlError::AuthError { .. } => e,
            other => EtlError::AuthError {
                scope: scope.to_string(),
                message: other.to_string(),
            },
        })?;

        if issued.value.is_empty() {
            return Err(EtlError::AuthError {
                scope: scope.to_string(),
                message: "Token endpoint returned an empty token".to_string(),
            });
        }

        let token = Token {
            value: issued.value,
            scope,
            expires_at: Some(self.expiry_for(scope, issued.ttl_seconds)?),
        };
        tracing::debug!("🔑 Acquired {} token, expires at {:?}", scope, token.expires_at);
        *cached = Some(token.clone());

        Ok(token)
    }
}
