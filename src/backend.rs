use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::answer::{stream_answer, Accumulator, AnswerState, Followup, Outcome, StreamError};
use crate::session::types::{AuthoredAnswer, HistoryMessage};

/// Where human-written answers are published.
const AUTHORED_SITE: &str = "https://aisafety.info/";
const HTML_WIDTH: usize = 100;

/// Body of `POST /chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub query: &'a str,
    pub mode: &'a str,
    pub history: &'a [HistoryMessage],
    #[serde(rename = "sessionId")]
    pub session_id: &'a str,
}

pub struct BackendClient {
    client: reqwest::Client,
    api_url: String,
    content_url: String,
}

impl BackendClient {
    pub fn from_env() -> Result<Self> {
        let api_url = dotenv::var("API_URL").unwrap_or_else(|_| "http://127.0.0.1:3001".to_string());
        let content_url = dotenv::var("CONTENT_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("{}/human", api_url.trim_end_matches('/')));
        Self::new(api_url, content_url)
    }

    pub fn new(api_url: impl Into<String>, content_url: impl Into<String>) -> Result<Self> {
        // No overall timeout: answers stream for as long as the model writes.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            content_url: content_url.into(),
        })
    }

    /// Resolve the chat endpoint from the base URL.
    fn endpoint(&self) -> Result<Url> {
        let base = self.api_url.trim_end_matches('/');
        let url = if base.ends_with("/chat") {
            base.to_string()
        } else {
            format!("{}/chat", base)
        };
        Url::parse(&url).with_context(|| format!("Invalid API_URL: {}", self.api_url))
    }

    /// Ask the backend a question and fold its answer stream.
    ///
    /// Transport failures and non-2xx responses become a failed outcome
    /// rather than an error. `cancel` is honoured while connecting as well as
    /// while streaming.
    pub async fn ask(
        &self,
        request: &ChatRequest<'_>,
        mut accumulator: Accumulator,
        cancel: &CancellationToken,
        mut on_update: impl FnMut(&AnswerState),
    ) -> Result<Outcome> {
        let url = self.endpoint()?;
        debug!(%url, mode = request.mode, history = request.history.len(), "sending chat request");

        let send = self
            .client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                accumulator.abort();
                on_update(accumulator.state());
                return Ok(accumulator.finish());
            }
            response = send => response,
        };

        match response {
            Err(e) => {
                warn!(error = %e, "chat request failed");
                accumulator.fail_stream(&StreamError::Transport(e.to_string()));
                on_update(accumulator.state());
            }
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "chat request rejected");
                accumulator.fail_stream(&StreamError::Status(resp.status().as_u16()));
                on_update(accumulator.state());
            }
            Ok(resp) => {
                stream_answer(Box::pin(resp.bytes_stream()), &mut accumulator, cancel, on_update).await;
            }
        }

        Ok(accumulator.finish())
    }

    /// Fetch the human-written answer for a follow-up question.
    pub async fn fetch_authored(&self, page_reference: &str) -> Result<AuthoredAnswer> {
        let url = format!("{}/{}", self.content_url.trim_end_matches('/'), page_reference);
        let json: Value = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Content request failed")?
            .error_for_status()
            .context("Content service returned an error")?
            .json()
            .await
            .context("Failed to parse content JSON")?;

        let answer = parse_authored(page_reference, &json)?;
        info!(page = %answer.page_reference, related = answer.related.len(), "fetched authored answer");
        Ok(answer)
    }
}

/// Page ids arrive as strings or numbers.
fn page_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse `{data: {text, pageid, title, relatedQuestions}}`.
pub fn parse_authored(requested: &str, json: &Value) -> Result<AuthoredAnswer> {
    let data = json.get("data").context("Content response has no `data`")?;
    let html = data
        .get("text")
        .and_then(Value::as_str)
        .context("Content response has no `text`")?;
    let page_reference = data
        .get("pageid")
        .and_then(page_id)
        .unwrap_or_else(|| requested.to_string());
    let title = data
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let content = html2text::from_read(html.as_bytes(), HTML_WIDTH).unwrap_or_else(|_| html.to_string());

    let related = data
        .get("relatedQuestions")
        .and_then(Value::as_array)
        .map(|questions| {
            questions
                .iter()
                .filter_map(|q| {
                    Some(Followup {
                        text: q.get("title")?.as_str()?.to_string(),
                        page_reference: q.get("pageid").and_then(page_id)?,
                        score: 0.0,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let url = Url::parse_with_params(AUTHORED_SITE, &[("state", page_reference.as_str())])
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("{}?state={}", AUTHORED_SITE, page_reference));

    Ok(AuthoredAnswer {
        page_reference,
        title,
        content: content.trim().to_string(),
        url,
        related,
    })
}
