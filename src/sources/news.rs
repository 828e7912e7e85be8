//! Headline client backed by Gemini `generateContent`
//!
//! API Documentation: https://ai.google.dev/api/generate-content
//!
//! The model is asked for a JSON array of ticker-sized headlines. Whatever it returns is
//! filtered and normalized here; if nothing usable survives, the call fails rather than
//! falling back to a canned list.

use super::{ensure_success, http_client, require_api_key, DataSource, Fetched, Freshness, SharedCache};
use crate::core::config::SourceConfig;
use crate::core::error::{MarketDataError, MarketDataResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const NAME: &str = "news";

/// Headlines longer than this do not fit the ticker
pub const MAX_HEADLINE_CHARS: usize = 65;

/// Headlines this short or shorter are noise
pub const MIN_HEADLINE_CHARS: usize = 15;

pub const MAX_HEADLINES: usize = 6;

const SYSTEM_PROMPT: &str = "You are a financial news curator for an investment website's news ticker.
Generate EXACTLY 6 concise financial headlines that are current and verified.

Requirements:
- Each headline MUST be at most 65 characters for ticker compatibility
- Style: Clean, professional, no hype words or emojis
- Mix: 4 GLOBAL financial items + 2 TEXAS/AUSTIN business items
- Focus: Markets, Economics, Policy, Major Tech, Energy - avoid sports/celebrity
- Time window: last 24 hours preferred, extend to 48 hours if needed
- Use verified sources with Google Search grounding

Output: Return JSON array of headline strings only (not objects).";

const USER_PROMPT: &str = "Generate 6 financial news headlines for a live ticker.
Requirements:
- 4 global financial/market headlines (at most 65 chars each)
- 2 Texas/Austin business/tech headlines (at most 65 chars each)
- Focus on: market moves, economic data, policy changes, major deals
- Current within 24-48 hours
- Professional tone, no speculation
Return only JSON array of headline strings.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headlines {
    pub items: Vec<String>,
    pub model: String,
}

pub struct NewsClient {
    source: DataSource,
    http: reqwest::Client,
    config: SourceConfig,
    model: String,
    freshness: Freshness,
}

impl NewsClient {
    pub fn new<S: Into<String>>(
        config: SourceConfig,
        model: S,
        freshness: Freshness,
        cache: SharedCache,
    ) -> MarketDataResult<Self> {
        let http = http_client(&config)?;
        let source = DataSource::new(NAME, config.rate_limit.clone(), cache);

        Ok(Self {
            source,
            http,
            config,
            model: model.into(),
            freshness,
        })
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    /// Current ticker headlines
    pub async fn headlines(&self) -> MarketDataResult<Fetched<Headlines>> {
        let api_key = require_api_key(NAME, &self.config)?;
        let url = format!(
            "{}/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.model
        );

        let request = self
            .http
            .post(url)
            .query(&[("key", api_key.as_str())])
            .json(&request_body());

        let model = self.model.clone();
        self.source
            .fetch_with_policy("headlines", self.freshness.headlines, move || async move {
                let response = ensure_success(NAME, request.send().await?)?;
                let payload: Value = response.json().await?;
                let items = parse_headlines(&payload)?;
                Ok(Headlines { items, model })
            })
            .await
    }
}

fn request_body() -> Value {
    json!({
        "contents": [
            { "role": "user", "parts": [{ "text": USER_PROMPT }] }
        ],
        "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
        "tools": [{ "googleSearch": {} }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "array",
                "items": { "type": "string", "description": "News headline of at most 65 characters" },
                "minItems": MAX_HEADLINES,
                "maxItems": MAX_HEADLINES
            }
        }
    })
}

/// Extract the model's JSON array and keep the usable headlines
pub(crate) fn parse_headlines(payload: &Value) -> MarketDataResult<Vec<String>> {
    let text = payload
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .ok_or_else(|| MarketDataError::transient(NAME, "Invalid response format from API"))?;

    let generated: Value = serde_json::from_str(text)
        .map_err(|e| MarketDataError::transient(NAME, format!("model output is not JSON: {}", e)))?;
    let candidates = generated
        .as_array()
        .ok_or_else(|| MarketDataError::transient(NAME, "model output is not an array"))?;

    let headlines: Vec<String> = candidates
        .iter()
        .filter_map(Value::as_str)
        .filter(|headline| is_usable(headline))
        .map(normalize_headline)
        .filter(|headline| !headline.is_empty())
        .take(MAX_HEADLINES)
        .collect();

    if headlines.is_empty() {
        return Err(MarketDataError::transient(NAME, "no usable headlines in model output"));
    }
    Ok(headlines)
}

fn is_usable(headline: &str) -> bool {
    let length = headline.chars().count();
    length > MIN_HEADLINE_CHARS && length <= MAX_HEADLINE_CHARS
}

/// Strip quote characters and collapse whitespace
fn normalize_headline(headline: &str) -> String {
    headline
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '\u{201C}' | '\u{201D}' | '\u{2018}' | '\u{2019}'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemini_response(model_text: &str) -> Value {
        json!({
            "candidates": [
                { "content": { "parts": [{ "text": model_text }], "role": "model" } }
            ]
        })
    }

    #[test]
    fn test_parse_filters_and_normalizes() {
        let text = serde_json::to_string(&vec![
            "Fed holds rates steady as inflation cools",
            "Too short",
            "\u{201C}Austin  chipmaker   expands fab\u{201D} with new hires",
            "This headline is far too long to fit on the ticker without being cut off somewhere",
        ])
        .unwrap();

        let headlines = parse_headlines(&gemini_response(&text)).unwrap();
        assert_eq!(
            headlines,
            vec![
                "Fed holds rates steady as inflation cools".to_string(),
                "Austin chipmaker expands fab with new hires".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_caps_count() {
        let items: Vec<String> = (0..10)
            .map(|i| format!("Markets rally for the {} straight session", i))
            .collect();
        let text = serde_json::to_string(&items).unwrap();

        assert_eq!(parse_headlines(&gemini_response(&text)).unwrap().len(), MAX_HEADLINES);
    }

    #[test]
    fn test_empty_result_is_failure() {
        let err = parse_headlines(&gemini_response("[\"short\"]")).unwrap_err();
        assert!(matches!(err, MarketDataError::TransientSource { .. }));

        let err = parse_headlines(&json!({ "candidates": [] })).unwrap_err();
        assert!(err.to_string().contains("Invalid response format"));

        assert!(parse_headlines(&gemini_response("{\"headline\": 1}")).is_err());
    }

    #[test]
    fn test_request_body_shape() {
        let body = request_body();
        assert_eq!(body["generationConfig"]["responseSchema"]["maxItems"], 6);
        assert!(body["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("65 characters"));
    }
}
