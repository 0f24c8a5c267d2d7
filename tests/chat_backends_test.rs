use analysis_etl::adapters::{build_backend, BackendSettings, Provider};
use analysis_etl::core::analysis::{analyze, InstructionTemplate, DEFAULT_PLACEHOLDER};
use analysis_etl::core::normalizer::ResponseNormalizer;
use analysis_etl::domain::model::{AnalysisOutcome, Batch, Record};
use analysis_etl::domain::ports::{AnalysisBackend, ChatPrompt};
use analysis_etl::utils::error::ErrorCategory;
use analysis_etl::EtlError;
use anyhow::Result;
use httpmock::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

fn settings(provider: Provider, server: &MockServer) -> BackendSettings {
    BackendSettings {
        provider,
        model: "test-model".to_string(),
        api_key: "sk-test".to_string(),
        base_url: Some(server.base_url()),
        temperature: 0.2,
        max_output_tokens: 512,
        timeout: Duration::from_secs(5),
    }
}

fn prompt() -> ChatPrompt {
    ChatPrompt {
        system: "Rate these: [{\"id\":7}]".to_string(),
        user: "Go.".to_string(),
    }
}

/// chat completions：system 與 user 兩則訊息，回傳 choices[0] 的內容
#[tokio::test]
async fn test_chat_completions_round_trip() -> Result<()> {
    let server = MockServer::start();
    let completion_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/chat/completions")
            .header("authorization", "Bearer sk-test")
            .body_contains("\"model\":\"test-model\"")
            .body_contains("\"role\":\"system\"")
            .body_contains("\"role\":\"user\"")
            .body_contains("\"max_tokens\":512");
        then.status(200).json_body(json!({
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "[{\"id\": \"7\", \"score\": 4}]"}}
            ]
        }));
    });

    let backend = build_backend(&settings(Provider::Deepseek, &server))?;
    let reply = backend.complete(&prompt()).await?;

    completion_mock.assert();
    assert_eq!(reply, "[{\"id\": \"7\", \"score\": 4}]");
    Ok(())
}

#[tokio::test]
async fn test_chat_completions_http_error_keeps_body() -> Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(503).body("upstream overloaded");
    });

    let backend = build_backend(&settings(Provider::Qwen, &server))?;
    let err = backend.complete(&prompt()).await.unwrap_err();

    match err {
        EtlError::BackendError {
            provider,
            raw_response,
            ..
        } => {
            assert_eq!(provider, "qwen");
            assert_eq!(raw_response.as_deref(), Some("upstream overloaded"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    Ok(())
}

/// Gemini：system 訊息成為 systemInstruction
#[tokio::test]
async fn test_gemini_chat_model_round_trip() -> Result<()> {
    let server = MockServer::start();
    let gemini_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1beta/models/test-model:generateContent")
            .header("x-goog-api-key", "sk-test")
            .body_contains("systemInstruction")
            .body_contains("Go.");
        then.status(200).json_body(json!({
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": "```json\n"}, {"text": "[{\"id\": 7}]\n```"}]}}
            ]
        }));
    });

    let backend = build_backend(&settings(Provider::Gemini, &server))?;
    let reply = backend.complete(&prompt()).await?;

    gemini_mock.assert();
    assert_eq!(reply, "```json\n[{\"id\": 7}]\n```");
    Ok(())
}

/// 後端錯誤在分析階段轉為 Failed 結果，不向外拋出
#[tokio::test]
async fn test_backend_failure_becomes_failed_outcome() -> Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1beta/models/test-model:generateContent");
        then.status(429).body("{\"error\": {\"status\": \"RESOURCE_EXHAUSTED\"}}");
    });

    let backend = build_backend(&settings(Provider::Gemini, &server))?;
    let template = InstructionTemplate::new("Data: {{TRANSACTION}}", DEFAULT_PLACEHOLDER)?;
    let normalizer = ResponseNormalizer::new(vec!["id".to_string()]);
    let record = match json!({"id": 7, "dialogue": "hello"}) {
        Value::Object(map) => Record::new(map),
        _ => unreachable!(),
    };
    let batch = Batch {
        index: 0,
        records: vec![record],
    };

    let (outcome, raw) = analyze(backend.as_ref(), &normalizer, &batch, &template).await;

    match outcome {
        AnalysisOutcome::Failed(failure) => {
            assert_eq!(failure.category, ErrorCategory::Analysis);
            assert!(failure.raw_text.unwrap_or_default().contains("RESOURCE_EXHAUSTED"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(raw.is_some());
    Ok(())
}
