//! Admission gate for oracle output.
//!
//! A response is trusted only if it is a JSON object whose `tag` is an object
//! with non-empty string `key` and `value`. `place`, `confidence` and
//! `explanation` are read leniently and never cause rejection.

use serde::Serialize;
use serde_json::Value;

use osmrag_evidence::OsmTag;

use crate::extract::{ParseOutcome, ParseStatus};

fn non_empty_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn is_valid(data: &Value) -> bool {
    check(data).is_ok()
}

fn check(data: &Value) -> Result<OsmTag, InvalidReason> {
    let obj = data.as_object().ok_or(InvalidReason::NotAnObject)?;
    let tag = obj
        .get("tag")
        .and_then(Value::as_object)
        .ok_or(InvalidReason::MissingTag)?;
    let key = non_empty_str(tag.get("key")).ok_or(InvalidReason::InvalidTagKey)?;
    let value = non_empty_str(tag.get("value")).ok_or(InvalidReason::InvalidTagValue)?;
    Ok(OsmTag::new(key, value))
}

/// A schema-valid oracle answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredResponse {
    /// Absent when the oracle returned null, a non-string or an empty string.
    pub place: Option<String>,
    pub tag: OsmTag,
    /// Advisory, clamped to `[0, 1]`; 0 when missing.
    pub confidence: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// The extractor produced no data; carries why.
    Absent(ParseStatus),
    NotAnObject,
    MissingTag,
    InvalidTagKey,
    InvalidTagValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", content = "detail", rename_all = "snake_case")]
pub enum LlmSignal {
    Valid(StructuredResponse),
    InvalidOrAbsent(InvalidReason),
}

impl LlmSignal {
    pub fn valid(&self) -> Option<&StructuredResponse> {
        match self {
            LlmSignal::Valid(r) => Some(r),
            LlmSignal::InvalidOrAbsent(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, LlmSignal::Valid(_))
    }
}

pub fn validate_value(data: &Value) -> LlmSignal {
    let tag = match check(data) {
        Ok(tag) => tag,
        Err(reason) => return LlmSignal::InvalidOrAbsent(reason),
    };
    let place = non_empty_str(data.get("place")).map(str::to_string);
    let confidence = data
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.0);
    let explanation = data
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    LlmSignal::Valid(StructuredResponse {
        place,
        tag,
        confidence,
        explanation,
    })
}

pub fn validate(outcome: &ParseOutcome) -> LlmSignal {
    let signal = match &outcome.data {
        Some(data) if outcome.ok() => validate_value(data),
        _ => LlmSignal::InvalidOrAbsent(InvalidReason::Absent(outcome.status)),
    };
    if let LlmSignal::InvalidOrAbsent(reason) = &signal {
        if !matches!(reason, InvalidReason::Absent(_)) {
            tracing::warn!(?reason, "oracle response failed schema validation");
        }
    }
    signal
}
