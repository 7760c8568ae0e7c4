//! Profile analysis and compatibility scoring.
//!
//! A thin client over the generative-language REST API. Every failure path
//! degrades to a deterministic local analysis so callers always get an answer.

use std::collections::HashSet;

use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::profiles::Profile;

pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMeta {
    pub used_fallback: bool,
    pub reason: Option<String>,
    pub model: String,
    pub configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAnalysis {
    pub strengths: Vec<String>,
    pub interests: Vec<String>,
    pub suggested_roles: Vec<String>,
    pub match_criteria: Vec<String>,
    pub summary: String,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<AnalysisMeta>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MatchScore {
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("AI returned no text")]
    Empty,
    #[error("AI returned non-JSON payload")]
    NotJson,
}

#[derive(Default)]
struct Diagnostics {
    last_error: Option<String>,
    last_model_used: Option<String>,
}

pub struct AiService {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    started_at: DateTime<Utc>,
    diagnostics: RwLock<Diagnostics>,
}

fn distinct_non_empty<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    crate::utils::dedupe_ids(items.into_iter().filter(|s| !s.is_empty()))
}

/// Local analysis built only from the profile's own fields.
pub fn fallback_analysis(user: &Profile) -> ProfileAnalysis {
    let mut words = user
        .areas
        .iter()
        .map(|a| a.to_lowercase())
        .collect::<Vec<_>>();
    words.extend(
        user.bio
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '.'))
            .filter(|w| w.chars().count() > 3)
            .map(str::to_lowercase),
    );
    let interests = distinct_non_empty(words).into_iter().take(8).collect();

    let level = if user.experience_level.is_empty() {
        "beginner".to_string()
    } else {
        user.experience_level.clone()
    };
    let strengths = distinct_non_empty(std::iter::once(level).chain(user.areas.iter().cloned()))
        .into_iter()
        .take(5)
        .collect();

    let match_criteria = distinct_non_empty(
        user.areas
            .iter()
            .cloned()
            .chain(std::iter::once(user.goals.clone())),
    )
    .into_iter()
    .take(6)
    .collect();

    let areas_text = if user.areas.is_empty() {
        "a variety of areas".to_string()
    } else {
        user.areas.join(", ")
    };
    let location = if user.location.is_empty() {
        "in an unspecified location".to_string()
    } else {
        format!("in {}", user.location)
    };
    let mut parts = vec![
        format!("{} (@{}) {}.", user.first_name, user.username, location),
        format!("Interests include {}.", areas_text),
    ];
    if !user.goals.is_empty() {
        parts.push(format!("Goals: {}.", user.goals));
    }
    if !user.experience_level.is_empty() {
        parts.push(format!("Experience level: {}.", user.experience_level));
    }

    ProfileAnalysis {
        strengths,
        interests,
        suggested_roles: vec!["mentor".into(), "mentee".into(), "teammate".into()],
        match_criteria,
        summary: parts.join(" "),
        meta: None,
    }
}

/// Case-insensitive Jaccard similarity; two empty sets score 0.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<String> = a.iter().map(|s| s.to_lowercase()).collect();
    let b: HashSet<String> = b.iter().map(|s| s.to_lowercase()).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Parses model output that may be wrapped in code fences or prose.
pub fn parse_json_loose(text: &str) -> Option<Value> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(cleaned) {
        return Some(value);
    }
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

fn ensure_array(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Null | Value::Bool(false) | Value::String(_) => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn or_fallback(primary: Vec<String>, fallback: &[String]) -> Vec<String> {
    if primary.is_empty() {
        fallback.to_vec()
    } else {
        primary
    }
}

fn prompt_for(user: &Profile) -> String {
    let name = format!("{} {}", user.first_name, user.last_name);
    let profile = json!({
        "id": user.id,
        "username": user.username,
        "name": name.trim(),
        "areas": user.areas,
        "goals": user.goals,
        "experienceLevel": user.experience_level,
        "bio": user.bio,
        "location": user.location,
        "createdAt": user.created_at,
    });
    [
        "You assist with matching compatible users.".to_string(),
        "Return a JSON with fields: strengths, interests, suggestedRoles, matchCriteria, summary."
            .to_string(),
        "The \"summary\" must be a single paragraph (2-4 sentences) in natural language; no bullet points, no markdown.".to_string(),
        "Base your output only on provided fields.".to_string(),
        String::new(),
        serde_json::to_string_pretty(&profile).unwrap_or_default(),
    ]
    .join("\n")
}

impl AiService {
    pub fn new(api_key: Option<String>, model: Option<String>) -> Self {
        Self::with_api_base(DEFAULT_API_BASE, api_key, model)
    }

    pub fn with_api_base(api_base: &str, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: crate::utils::non_empty(api_key),
            model: crate::utils::non_empty(model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            started_at: Utc::now(),
            diagnostics: RwLock::new(Diagnostics::default()),
        }
    }

    pub fn configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn status(&self) -> Value {
        let diagnostics = self.diagnostics.read().await;
        json!({
            "configured": self.configured(),
            "model": self.model,
            "startedAt": self.started_at,
            "lastError": diagnostics.last_error,
            "lastModelUsed": diagnostics.last_model_used,
        })
    }

    async fn generate(&self, api_key: &str, model: &str, prompt: String) -> Result<String, UpstreamError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.api_base, model);
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": 0.4,
                "maxOutputTokens": 800,
                "responseMimeType": "application/json"
            }
        });
        let response: Value = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .ok_or(UpstreamError::Empty)
    }

    pub async fn analyze(&self, user: &Profile, model_hint: Option<&str>) -> ProfileAnalysis {
        let model = model_hint
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.model.as_str())
            .to_string();
        self.diagnostics.write().await.last_model_used = Some(model.clone());

        let fallback = fallback_analysis(user);
        let Some(api_key) = self.api_key.as_deref() else {
            log::debug!("AI fallback (no api key) for {}", user.username);
            return ProfileAnalysis {
                meta: Some(AnalysisMeta {
                    used_fallback: true,
                    reason: Some("no_api_key".into()),
                    model,
                    configured: false,
                    error: None,
                }),
                ..fallback
            };
        };

        let parsed = self
            .generate(api_key, &model, prompt_for(user))
            .await
            .and_then(|text| parse_json_loose(&text).ok_or(UpstreamError::NotJson));

        match parsed {
            Ok(value) => {
                let summary = value
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let used_fallback = summary.is_empty();
                ProfileAnalysis {
                    strengths: or_fallback(ensure_array(value.get("strengths")), &fallback.strengths),
                    interests: or_fallback(ensure_array(value.get("interests")), &fallback.interests),
                    suggested_roles: or_fallback(
                        ensure_array(value.get("suggestedRoles")),
                        &fallback.suggested_roles,
                    ),
                    match_criteria: or_fallback(
                        ensure_array(value.get("matchCriteria")),
                        &fallback.match_criteria,
                    ),
                    summary: if used_fallback { fallback.summary } else { summary },
                    meta: Some(AnalysisMeta {
                        used_fallback,
                        reason: used_fallback.then(|| "empty_ai_summary".to_string()),
                        model,
                        configured: true,
                        error: None,
                    }),
                }
            }
            Err(e) => {
                let error = e.to_string();
                log::error!("AI analyze error: {}", error);
                self.diagnostics.write().await.last_error = Some(error.clone());
                ProfileAnalysis {
                    meta: Some(AnalysisMeta {
                        used_fallback: true,
                        reason: Some("upstream_error".into()),
                        model,
                        configured: true,
                        error: Some(error),
                    }),
                    ..fallback
                }
            }
        }
    }

    pub async fn score(&self, a: &Profile, b: &Profile) -> MatchScore {
        let (pa, pb) = futures::join!(self.analyze(a, None), self.analyze(b, None));
        let areas = jaccard(&a.areas, &b.areas);
        let interests = jaccard(&pa.interests, &pb.interests);
        let criteria = jaccard(&pa.match_criteria, &pb.match_criteria);

        let mut reasons = Vec::new();
        if areas > 0.0 {
            reasons.push("Area overlap".to_string());
        }
        if interests > 0.0 {
            reasons.push("Interest similarity".to_string());
        }
        if criteria > 0.0 {
            reasons.push("Criteria alignment".to_string());
        }
        MatchScore {
            score: (areas * 0.4 + interests * 0.35 + criteria * 0.25).min(1.0),
            reasons,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    user: Option<Profile>,
    model_hint: Option<String>,
}

#[derive(Deserialize)]
struct ScoreRequest {
    a: Option<Profile>,
    b: Option<Profile>,
}

async fn ai_status(ai: web::Data<AiService>) -> HttpResponse {
    HttpResponse::Ok().json(ai.status().await)
}

async fn ai_analyze(
    ai: web::Data<AiService>,
    body: web::Json<AnalyzeRequest>,
) -> Result<HttpResponse, ChatError> {
    let AnalyzeRequest { user, model_hint } = body.into_inner();
    let user = user
        .filter(|u| !u.id.is_empty() && !u.username.is_empty())
        .ok_or_else(|| ChatError::invalid("Invalid user payload"))?;

    let analysis = ai.analyze(&user, model_hint.as_deref()).await;
    let (model, used_fallback) = analysis
        .meta
        .as_ref()
        .map(|m| (m.model.clone(), m.used_fallback))
        .unwrap_or_else(|| (ai.model().to_string(), false));

    Ok(HttpResponse::Ok()
        .insert_header(("X-AI-Model", model))
        .insert_header(("X-AI-Used-Fallback", used_fallback.to_string()))
        .json(analysis))
}

async fn ai_score(
    ai: web::Data<AiService>,
    body: web::Json<ScoreRequest>,
) -> Result<HttpResponse, ChatError> {
    let ScoreRequest { a, b } = body.into_inner();
    let (Some(a), Some(b)) = (a, b) else {
        return Err(ChatError::invalid("Invalid payload"));
    };
    Ok(HttpResponse::Ok().json(ai.score(&a, &b).await))
}

pub fn ai_scope(cfg: &mut web::ServiceConfig) {
    cfg.route("/status", web::get().to(ai_status))
        .route("/analyze", web::post().to(ai_analyze))
        .route("/score", web::post().to(ai_score));
}
