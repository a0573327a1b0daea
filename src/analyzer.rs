//! HTTP client for the Rspamd-compatible analysis service
//!
//! Three operations, all POSTing the raw RFC 5322 message:
//! `/checkv2` returns a scan verdict, `/learnham` and `/learnspam`
//! train the filter. Envelope data the daemon already holds is passed
//! along as hint headers so the analyzer does not have to re-parse the
//! message headers.

use std::collections::HashMap;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

const CONTENT_TYPE_JSON: &str = "application/json";

/// Scan verdict returned by the `/checkv2` endpoint.
///
/// <https://rspamd.com/doc/architecture/protocol.html#protocol-basics>
#[derive(Debug, Clone, Deserialize)]
pub struct CheckResult {
    pub action: String,
    pub score: f32,
    pub is_skipped: bool,
    #[serde(default)]
    pub symbols: HashMap<String, Symbol>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub score: f32,
}

/// Pre-processed envelope data sent as hint headers with every request.
#[derive(Debug, Clone, Default)]
pub struct MessageHints {
    pub deliver_to: Option<String>,
    pub from: Vec<String>,
    pub recipients: Vec<String>,
    pub subject: String,
}

/// Client for an Rspamd-compatible analyzer HTTP endpoint.
#[derive(Debug, Clone)]
pub struct Analyzer {
    client: reqwest::Client,
    check_url: String,
    ham_url: String,
    spam_url: String,
    password: String,
}

impl Analyzer {
    pub fn new(base_url: &str, password: impl Into<String>) -> Self {
        let base = base_url.trim_end_matches('/');

        Self {
            client: reqwest::Client::new(),
            check_url: format!("{base}/checkv2"),
            ham_url: format!("{base}/learnham"),
            spam_url: format!("{base}/learnspam"),
            password: password.into(),
        }
    }

    /// Submit a message for scanning and return the verdict.
    pub async fn check(&self, message: Vec<u8>, hints: &MessageHints) -> Result<CheckResult> {
        let resp = self.send(&self.check_url, message, hints).await?;

        if resp.status() != StatusCode::OK {
            return Err(Error::AnalyzerStatus(status_line(&resp)));
        }

        let ctype = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !ctype.starts_with(CONTENT_TYPE_JSON) {
            return Err(Error::AnalyzerContentType(ctype));
        }

        Ok(resp.json().await?)
    }

    /// Train the message as ham.
    pub async fn learn_ham(&self, message: Vec<u8>, hints: &MessageHints) -> Result<()> {
        self.learn(&self.ham_url, message, hints).await
    }

    /// Train the message as spam.
    pub async fn learn_spam(&self, message: Vec<u8>, hints: &MessageHints) -> Result<()> {
        self.learn(&self.spam_url, message, hints).await
    }

    async fn learn(&self, url: &str, message: Vec<u8>, hints: &MessageHints) -> Result<()> {
        let resp = self.send(url, message, hints).await?;

        // 208 means "already learned", every 2xx counts as success
        if !resp.status().is_success() {
            return Err(Error::AnalyzerStatus(status_line(&resp)));
        }

        if resp.status() != StatusCode::OK {
            debug!(url, status = %resp.status(), "learn request answered with non-200 success");
        }

        Ok(())
    }

    async fn send(&self, url: &str, message: Vec<u8>, hints: &MessageHints) -> Result<Response> {
        let mut req = self
            .client
            .post(url)
            .header("password", &self.password)
            .body(message);

        // hints are best-effort, values a header cannot carry are dropped
        if let Some(deliver_to) = &hints.deliver_to {
            if let Ok(v) = HeaderValue::from_str(deliver_to) {
                req = req.header("Deliver-To", v);
            }
        }
        if !hints.subject.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&hints.subject) {
                req = req.header("Subject", v);
            }
        }
        for rcpt in &hints.recipients {
            if let Ok(v) = HeaderValue::from_str(rcpt) {
                req = req.header("Rcpt", v);
            }
        }
        for from in &hints.from {
            if let Ok(v) = HeaderValue::from_str(from) {
                req = req.header("From", v);
            }
        }

        Ok(req.send().await?)
    }
}

fn status_line(resp: &Response) -> String {
    let status = resp.status();
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}
