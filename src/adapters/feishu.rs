use crate::domain::model::{Record, Token, TokenScope, WriteRequest};
use crate::domain::ports::{IssuedToken, RecordPage, RecordPager, RemoteSink, TokenFetcher};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn";
const RECORD_PAGE_SIZE: u32 = 100;
const FIELD_PAGE_SIZE: u32 = 20;

// 飛書開放平台錯誤碼
const CODE_FIELD_NAME_NOT_FOUND: i64 = 1254045;
const CODE_RECORD_ADD_ONCE_EXCEED_LIMIT: i64 = 1254104;
const CODES_INVALID_TOKEN: [i64; 3] = [99991661, 99991663, 99991668];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCredentials {
    pub app_id: String,
    pub app_secret: String,
}

/// 飛書開放平台 API 客戶端，負責 token、多維表格讀寫
#[derive(Clone)]
pub struct FeishuClient {
    client: Client,
    base_url: String,
    read_credentials: Option<AppCredentials>,
    write_credentials: Option<AppCredentials>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RecordListData {
    #[serde(default)]
    items: Option<Vec<RecordItem>>,
    #[serde(default)]
    has_more: bool,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordItem {
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct FieldListData {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default)]
    has_more: bool,
    page_token: Option<String>,
}

#[derive(Serialize)]
struct BatchCreateBody<'a> {
    records: Vec<FieldsEntry<'a>>,
}

#[derive(Serialize)]
struct FieldsEntry<'a> {
    fields: &'a Map<String, Value>,
}

impl FeishuClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            read_credentials: None,
            write_credentials: None,
        })
    }

    pub fn with_credentials(mut self, scope: TokenScope, credentials: Option<AppCredentials>) -> Self {
        match scope {
            TokenScope::Read => self.read_credentials = credentials,
            TokenScope::Write => self.write_credentials = credentials,
        }
        self
    }

    fn table_url(&self, app_token: &str, table_id: &str, suffix: &str) -> String {
        format!(
            "{}/open-apis/bitable/v1/apps/{}/tables/{}/{}",
            self.base_url, app_token, table_id, suffix
        )
    }

    /// 解析飛書回應：即使 HTTP 狀態非 2xx，body 通常仍帶有 code/msg
    async fn read_envelope<T: DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<Envelope<T>> {
        let status = response.status();
        let body = response.text().await?;
        match serde_json::from_str::<Envelope<T>>(&body) {
            Ok(envelope) => Ok(envelope),
            Err(e) if status.is_success() => Err(EtlError::RemoteApiError {
                operation: operation.to_string(),
                code: -1,
                message: format!("Unreadable response body ({}): {}", e, body),
            }),
            Err(_) => Err(EtlError::RemoteApiError {
                operation: operation.to_string(),
                code: status.as_u16() as i64,
                message: body,
            }),
        }
    }

    /// 分頁取得資料表的欄位定義
    pub async fn list_fields(&self, token: &Token, app_token: &str, table_id: &str) -> Result<Vec<Value>> {
        let url = self.table_url(app_token, table_id, "fields");
        let mut fields = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(&token.value)
                .query(&[("page_size", FIELD_PAGE_SIZE.to_string())]);
            if let Some(cursor) = &page_token {
                request = request.query(&[("page_token", cursor)]);
            }

            let envelope: Envelope<FieldListData> =
                Self::read_envelope("list_fields", request.send().await?).await?;
            if envelope.code != 0 {
                return Err(classify_error("list_fields", token.scope, envelope.code, envelope.msg, &[]));
            }
            let Some(data) = envelope.data else { break };
            fields.extend(data.items.unwrap_or_default());

            match data.page_token.filter(|c| data.has_more && !c.is_empty()) {
                Some(next) if page_token.as_deref() != Some(next.as_str()) => page_token = Some(next),
                _ => break,
            }
        }

        tracing::info!("📑 Table {} has {} fields", table_id, fields.len());
        Ok(fields)
    }
}

#[async_trait]
impl TokenFetcher for FeishuClient {
    async fn fetch_token(&self, scope: TokenScope) -> Result<IssuedToken> {
        let credentials = match scope {
            TokenScope::Read => self.read_credentials.as_ref(),
            TokenScope::Write => self.write_credentials.as_ref(),
        }
        .ok_or_else(|| EtlError::AuthError {
            scope: scope.to_string(),
            message: "No app credentials or static token configured".to_string(),
        })?;

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        tracing::debug!("🔑 Requesting {} tenant_access_token for app {}", scope, credentials.app_id);

        let response = self.client.post(url).json(credentials).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let parsed: TenantTokenResponse =
            serde_json::from_str(&body).map_err(|e| EtlError::AuthError {
                scope: scope.to_string(),
                message: format!("HTTP {}: unreadable token response ({}): {}", status, e, body),
            })?;

        match (parsed.code, parsed.tenant_access_token) {
            (0, Some(value)) if !value.is_empty() => {
                tracing::info!("🔑 Obtained {} tenant_access_token", scope);
                Ok(IssuedToken {
                    value,
                    ttl_seconds: parsed.expire.unwrap_or(0),
                })
            }
            (code, _) => Err(EtlError::AuthError {
                scope: scope.to_string(),
                message: format!("code={}, msg={}", code, parsed.msg),
            }),
        }
    }
}

/// 指向某個資料表（與可選視圖）的讀取端
pub struct BitableReader {
    client: FeishuClient,
    app_token: String,
    table_id: String,
    view_id: Option<String>,
}

impl BitableReader {
    pub fn new(client: FeishuClient, app_token: String, table_id: String, view_id: Option<String>) -> Self {
        Self {
            client,
            app_token,
            table_id,
            view_id: view_id.filter(|v| !v.is_empty()),
        }
    }
}

#[async_trait]
impl RecordPager for BitableReader {
    async fn fetch_page(
        &self,
        token: &Token,
        fields: &[String],
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        let url = self.client.table_url(&self.app_token, &self.table_id, "records");
        let mut query: Vec<(&str, String)> = vec![
            ("page_size", RECORD_PAGE_SIZE.to_string()),
            ("user_id_type", "open_id".to_string()),
        ];
        if let Some(view_id) = &self.view_id {
            query.push(("view_id", view_id.clone()));
        }
        if !fields.is_empty() {
            query.push(("field_names", serde_json::to_string(fields)?));
        }
        if let Some(cursor) = cursor {
            query.push(("page_token", cursor.to_string()));
        }

        let response = self
            .client
            .client
            .get(url)
            .bearer_auth(&token.value)
            .query(&query)
            .send()
            .await?;
        let envelope: Envelope<RecordListData> =
            FeishuClient::read_envelope("list_records", response).await?;

        if envelope.code != 0 {
            tracing::error!("❌ Feishu list failed: code={}, msg={}", envelope.code, envelope.msg);
            return Err(classify_error("list_records", token.scope, envelope.code, envelope.msg, &[]));
        }

        let data = envelope.data.unwrap_or(RecordListData {
            items: None,
            has_more: false,
            page_token: None,
        });
        Ok(RecordPage {
            items: data
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|item| Record::new(item.fields))
                .collect(),
            has_more: data.has_more,
            next_cursor: data.page_token,
        })
    }
}

/// 寫入端，資料表 id 由 WriteRequest 決定
pub struct BitableWriter {
    client: FeishuClient,
    app_token: String,
}

impl BitableWriter {
    pub fn new(client: FeishuClient, app_token: String) -> Self {
        Self { client, app_token }
    }
}

#[async_trait]
impl RemoteSink for BitableWriter {
    async fn batch_create(&self, request: &WriteRequest, token: &Token) -> Result<usize> {
        if request.records.is_empty() {
            return Ok(0);
        }

        let url = self
            .client
            .table_url(&self.app_token, &request.table_id, "records/batch_create");
        let body = BatchCreateBody {
            records: request
                .records
                .iter()
                .map(|fields| FieldsEntry { fields })
                .collect(),
        };

        let response = self
            .client
            .client
            .post(url)
            .bearer_auth(&token.value)
            .json(&body)
            .send()
            .await?;
        let envelope: Envelope<Value> = FeishuClient::read_envelope("batch_create", response).await?;

        if envelope.code != 0 {
            tracing::error!(
                "❌ Feishu batch_create failed: code={}, msg={}",
                envelope.code,
                envelope.msg
            );
            return Err(classify_error(
                "batch_create",
                token.scope,
                envelope.code,
                envelope.msg,
                &request.records,
            ));
        }

        tracing::debug!("💾 batch_create stored {} records", request.records.len());
        Ok(request.records.len())
    }
}

/// 將已知的錯誤碼轉為對應的錯誤，其餘歸為一般遠端錯誤
fn classify_error(
    operation: &str,
    scope: TokenScope,
    code: i64,
    msg: String,
    records: &[Map<String, Value>],
) -> EtlError {
    match code {
        CODE_FIELD_NAME_NOT_FOUND => {
            let fields: BTreeSet<&String> = records.iter().flat_map(|r| r.keys()).collect();
            EtlError::FieldNameNotFound {
                fields: fields.into_iter().cloned().collect(),
                message: msg,
            }
        }
        CODE_RECORD_ADD_ONCE_EXCEED_LIMIT => EtlError::BatchLimitExceeded {
            size: records.len(),
            message: msg,
        },
        c if CODES_INVALID_TOKEN.contains(&c) => EtlError::AuthError {
            scope: scope.to_string(),
            message: format!("{} rejected the token: code={}, msg={}", operation, code, msg),
        },
        _ => EtlError::RemoteApiError {
            operation: operation.to_string(),
            code,
            message: msg,
        },
    }
}
