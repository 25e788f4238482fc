//! Ollama-backed classifier for `ai_classification` nodes
//!
//! Sends the latest message of the thread to a local Ollama instance and
//! maps the model's answer onto one of the node's categories.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{Classification, ClassificationRequest, Classifier};
use crate::config::OllamaConfig;
use crate::error::{FlowError, Result};
use crate::types::workflow::OTHER_CATEGORY;

const CLASSIFICATION_PROMPT: &str = r#"Classify this email into exactly one category.

Categories:
{categories}
{instructions}
Email:
From: {from}
Subject: {subject}
Body (first 500 chars): {body}

Respond with ONLY the category name on the first line. If none fits, respond with "other"."#;

/// Ollama API generate response (non-streaming)
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

pub struct OllamaClassifier {
    client: Client,
    config: OllamaConfig,
}

impl OllamaClassifier {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FlowError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn build_prompt(request: &ClassificationRequest) -> String {
        let body_preview = request.body.chars().take(500).collect::<String>();
        let categories = request
            .categories
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n");
        let instructions = request
            .instructions
            .as_deref()
            .map(|i| format!("\nInstructions: {}\n", i))
            .unwrap_or_default();

        CLASSIFICATION_PROMPT
            .replace("{categories}", &categories)
            .replace("{instructions}", &instructions)
            .replace("{from}", &request.from)
            .replace(
                "{subject}",
                if request.subject.is_empty() {
                    "(no subject)"
                } else {
                    &request.subject
                },
            )
            .replace("{body}", &body_preview)
    }

    async fn call_ollama(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.config.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_predict": 40
            }
        });

        debug!("Calling Ollama at {} with model {}", url, self.config.model);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FlowError::Network(format!("Ollama request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(FlowError::Network(format!(
                "Ollama returned status: {}",
                resp.status()
            )));
        }

        let parsed: OllamaGenerateResponse = resp
            .json()
            .await
            .map_err(|e| FlowError::Parse(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(parsed.response)
    }

    /// Pick the category named on the first line; fall back to any category
    /// mentioned anywhere, then to "other".
    fn parse_response(response: &str, categories: &[String]) -> Classification {
        let cleaned = response.trim();
        let first_line = cleaned
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();

        let exact = categories
            .iter()
            .find(|c| c.to_lowercase() == first_line);
        let mentioned = || {
            let lower = cleaned.to_lowercase();
            categories.iter().find(|c| lower.contains(&c.to_lowercase()))
        };

        let category = match exact.or_else(mentioned) {
            Some(c) => c.clone(),
            None => {
                warn!("Ollama returned unrecognized category: {}", cleaned);
                OTHER_CATEGORY.to_string()
            }
        };

        Classification {
            category,
            reasoning: Some(format!("Ollama classification: {}", cleaned)),
        }
    }
}

#[async_trait]
impl Classifier for OllamaClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification> {
        let prompt = Self::build_prompt(request);
        let response = self.call_ollama(&prompt).await?;
        Ok(Self::parse_response(&response, &request.categories))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> Vec<String> {
        vec!["Sales".to_string(), "Support".to_string()]
    }

    #[test]
    fn test_parse_exact_first_line() {
        let result = OllamaClassifier::parse_response("support\nThe user needs help.", &categories());
        assert_eq!(result.category, "Support");
    }

    #[test]
    fn test_parse_mentioned_category() {
        let result = OllamaClassifier::parse_response("This looks like a Sales lead.", &categories());
        assert_eq!(result.category, "Sales");
    }

    #[test]
    fn test_parse_unknown_falls_back_to_other() {
        let result = OllamaClassifier::parse_response("newsletter", &categories());
        assert_eq!(result.category, OTHER_CATEGORY);
    }

    #[test]
    fn test_prompt_lists_categories() {
        let prompt = OllamaClassifier::build_prompt(&ClassificationRequest {
            categories: categories(),
            instructions: Some("Invoices are sales".into()),
            from: "a@b.com".into(),
            subject: String::new(),
            body: "hello".into(),
        });
        assert!(prompt.contains("- Sales\n- Support"));
        assert!(prompt.contains("Invoices are sales"));
        assert!(prompt.contains("(no subject)"));
    }
}
