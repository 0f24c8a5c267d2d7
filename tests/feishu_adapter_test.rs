use analysis_etl::adapters::feishu::{AppCredentials, BitableReader, BitableWriter, FeishuClient};
use analysis_etl::core::auth::TokenManager;
use analysis_etl::core::source::PagedRecordSource;
use analysis_etl::domain::model::{Token, TokenScope, WriteRequest};
use analysis_etl::domain::ports::{RecordSource, RemoteSink};
use analysis_etl::EtlError;
use anyhow::Result;
use httpmock::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

const TOKEN_PATH: &str = "/open-apis/auth/v3/tenant_access_token/internal";
const RECORDS_PATH: &str = "/open-apis/bitable/v1/apps/bascnSource/tables/tblSource/records";
const BATCH_CREATE_PATH: &str =
    "/open-apis/bitable/v1/apps/bascnSink/tables/tblResults/records/batch_create";

fn client(server: &MockServer) -> Result<FeishuClient> {
    Ok(FeishuClient::new(server.base_url(), Duration::from_secs(5))?
        .with_credentials(
            TokenScope::Read,
            Some(AppCredentials {
                app_id: "cli_reader".to_string(),
                app_secret: "reader-secret".to_string(),
            }),
        ))
}

fn static_token(value: &str, scope: TokenScope) -> Token {
    Token {
        value: value.to_string(),
        scope,
        expires_at: None,
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// token 在有效期內只向端點請求一次
#[tokio::test]
async fn test_tenant_token_is_fetched_once_and_reused() -> Result<()> {
    let server = MockServer::start();
    let token_mock = server.mock(|when, then| {
        when.method(POST)
            .path(TOKEN_PATH)
            .json_body(json!({"app_id": "cli_reader", "app_secret": "reader-secret"}));
        then.status(200).json_body(json!({
            "code": 0,
            "msg": "ok",
            "tenant_access_token": "t-read-123",
            "expire": 7200
        }));
    });

    let tokens = TokenManager::new(Arc::new(client(&server)?)).with_refresh_margin(60);

    let first = tokens.acquire(TokenScope::Read).await?;
    let second = tokens.acquire(TokenScope::Read).await?;

    assert_eq!(first.value, "t-read-123");
    assert_eq!(second.value, first.value);
    assert!(first.expires_at.is_some());
    token_mock.assert_hits(1);
    Ok(())
}

#[tokio::test]
async fn test_rejected_credentials_are_auth_errors() -> Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(200)
            .json_body(json!({"code": 10003, "msg": "invalid param"}));
    });

    let tokens = TokenManager::new(Arc::new(client(&server)?));

    let err = tokens.acquire(TokenScope::Read).await.unwrap_err();
    assert!(matches!(err, EtlError::AuthError { .. }));

    // 寫入端未設定憑證
    let err = tokens.acquire(TokenScope::Write).await.unwrap_err();
    assert!(matches!(err, EtlError::AuthError { .. }));
    Ok(())
}

/// 單頁讀取：帶入 view 與 bearer token，只保留允許的欄位
#[tokio::test]
async fn test_list_records_filters_fields_and_sends_view() -> Result<()> {
    let server = MockServer::start();
    let list_mock = server.mock(|when, then| {
        when.method(GET)
            .path(RECORDS_PATH)
            .header("authorization", "Bearer t-static")
            .query_param("page_size", "100")
            .query_param("view_id", "vewMain");
        then.status(200).json_body(json!({
            "code": 0,
            "msg": "success",
            "data": {
                "has_more": false,
                "page_token": null,
                "total": 2,
                "items": [
                    {"record_id": "rec1", "fields": {"id": 1, "dialogue": "hi", "phone": "555-0100"}},
                    {"record_id": "rec2", "fields": {"dialogue": "no key", "id": 2}}
                ]
            }
        }));
    });

    let reader = BitableReader::new(
        client(&server)?,
        "bascnSource".to_string(),
        "tblSource".to_string(),
        Some("vewMain".to_string()),
    );
    let tokens = TokenManager::new(Arc::new(client(&server)?))
        .with_static_token(TokenScope::Read, Some("t-static".to_string()));
    let source = PagedRecordSource::new(reader, Arc::new(tokens));

    let records = source
        .fetch(&["id".to_string(), "dialogue".to_string()])
        .await?;

    list_mock.assert();
    assert_eq!(records.len(), 2);
    assert_eq!(Value::Object(records[0].data.clone()), json!({"id": 1, "dialogue": "hi"}));
    // 依允許清單的順序重建欄位
    let keys: Vec<&String> = records[1].data.keys().collect();
    assert_eq!(keys, vec!["id", "dialogue"]);
    Ok(())
}

#[tokio::test]
async fn test_list_records_error_code_aborts_fetch() -> Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(RECORDS_PATH);
        then.status(200)
            .json_body(json!({"code": 1254040, "msg": "BaseTokenNotFound"}));
    });

    let reader = BitableReader::new(
        client(&server)?,
        "bascnSource".to_string(),
        "tblSource".to_string(),
        None,
    );
    let tokens = TokenManager::new(Arc::new(client(&server)?))
        .with_static_token(TokenScope::Read, Some("t-static".to_string()));
    let source = PagedRecordSource::new(reader, Arc::new(tokens));

    let err = source.fetch(&["id".to_string()]).await.unwrap_err();
    assert!(matches!(err, EtlError::RemoteApiError { code: 1254040, .. }));
    Ok(())
}

#[tokio::test]
async fn test_batch_create_posts_fields_envelope() -> Result<()> {
    let server = MockServer::start();
    let create_mock = server.mock(|when, then| {
        when.method(POST)
            .path(BATCH_CREATE_PATH)
            .header("authorization", "Bearer t-write")
            .json_body(json!({
                "records": [
                    {"fields": {"id": 1, "label": "complaint"}},
                    {"fields": {"id": 2, "label": "praise"}}
                ]
            }));
        then.status(200)
            .json_body(json!({"code": 0, "msg": "success", "data": {"records": []}}));
    });

    let writer = BitableWriter::new(client(&server)?, "bascnSink".to_string());
    let request = WriteRequest {
        table_id: "tblResults".to_string(),
        records: vec![
            fields(json!({"id": 1, "label": "complaint"})),
            fields(json!({"id": 2, "label": "praise"})),
        ],
    };

    let written = writer
        .batch_create(&request, &static_token("t-write", TokenScope::Write))
        .await?;

    create_mock.assert();
    assert_eq!(written, 2);
    Ok(())
}

/// 欄位不存在時回報嘗試寫入的欄位名稱
#[tokio::test]
async fn test_batch_create_reports_field_name_not_found() -> Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(BATCH_CREATE_PATH);
        then.status(400)
            .json_body(json!({"code": 1254045, "msg": "FieldNameNotFound"}));
    });

    let writer = BitableWriter::new(client(&server)?, "bascnSink".to_string());
    let request = WriteRequest {
        table_id: "tblResults".to_string(),
        records: vec![fields(json!({"id": 1, "sentiment_score": 3}))],
    };

    let err = writer
        .batch_create(&request, &static_token("t-write", TokenScope::Write))
        .await
        .unwrap_err();

    match err {
        EtlError::FieldNameNotFound { fields, message } => {
            assert_eq!(fields, vec!["id", "sentiment_score"]);
            assert_eq!(message, "FieldNameNotFound");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_batch_create_invalid_token_is_auth_error() -> Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(BATCH_CREATE_PATH);
        then.status(400)
            .json_body(json!({"code": 99991663, "msg": "Invalid access token for authorization"}));
    });

    let writer = BitableWriter::new(client(&server)?, "bascnSink".to_string());
    let request = WriteRequest {
        table_id: "tblResults".to_string(),
        records: vec![fields(json!({"id": 1}))],
    };

    let err = writer
        .batch_create(&request, &static_token("stale", TokenScope::Write))
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::AuthError { ref scope, .. } if scope == "write"));
    Ok(())
}

#[tokio::test]
async fn test_list_fields_returns_catalogue() -> Result<()> {
    let server = MockServer::start();
    let fields_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/open-apis/bitable/v1/apps/bascnSource/tables/tblSource/fields")
            .query_param("page_size", "20");
        then.status(200).json_body(json!({
            "code": 0,
            "msg": "success",
            "data": {
                "has_more": false,
                "items": [
                    {"field_id": "fld1", "field_name": "id", "type": 2},
                    {"field_id": "fld2", "field_name": "dialogue", "type": 1}
                ]
            }
        }));
    });

    let feishu = client(&server)?;
    let catalogue = feishu
        .list_fields(&static_token("t-read", TokenScope::Read), "bascnSource", "tblSource")
        .await?;

    fields_mock.assert();
    assert_eq!(catalogue.len(), 2);
    assert_eq!(catalogue[1]["field_name"], "dialogue");
    Ok(())
}
