use anyhow::{Result, anyhow};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::ModelConfig;
use crate::errors::GenerationError;
use crate::http_client::build_client;
use crate::records::CivilizationStat;

pub const META_SYSTEM_ROLE: &str =
    "You are an expert Age of Empires 4 competitive analyst who provides data-driven meta analysis.";
pub const GUIDE_SYSTEM_ROLE: &str =
    "You are an expert Age of Empires 4 coach who provides practical, data-driven advice.";

const TEXT_FIELDS: &[&str] = &[
    "early_game",
    "mid_game",
    "late_game",
    "key_units",
    "key_technologies",
    "reasoning",
];

/// Chat seam: one system + user exchange that must come back as a single
/// JSON object. Implementations decide transport and model.
pub trait ChatModel {
    fn complete_json(&self, system: &str, user: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Live chat-completions client.
pub struct OpenAiChat {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg.require_api_key()?.to_string();
        Ok(Self {
            client: build_client(cfg.timeout_secs)?,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        })
    }
}

impl ChatModel for OpenAiChat {
    fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("model API error {status}: {body}"));
        }

        #[derive(Deserialize)]
        struct Message {
            content: String,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<Choice>,
        }

        let parsed: ApiResponse = resp.json()?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("model returned no choices"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Validated shape of one generated report. The model is an untrusted
/// producer; nothing reaches the store without passing through here.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSections {
    pub early_game: String,
    pub mid_game: String,
    pub late_game: String,
    pub key_units: String,
    pub key_technologies: String,
    pub confidence: u8,
    pub reasoning: String,
}

pub fn parse_report_json(raw: &str) -> Result<ReportSections, String> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| format!("not a JSON object: {err}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| "top level is not an object".to_string())?;

    let mut texts = Vec::with_capacity(TEXT_FIELDS.len());
    for key in TEXT_FIELDS {
        let text = obj
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("field `{key}` missing, empty or not a string"))?;
        texts.push(text.to_string());
    }
    let confidence = coerce_confidence(obj.get("confidence"))?;

    let [early_game, mid_game, late_game, key_units, key_technologies, reasoning]: [String; 6] =
        texts
            .try_into()
            .map_err(|_| "unexpected field count".to_string())?;
    Ok(ReportSections {
        early_game,
        mid_game,
        late_game,
        key_units,
        key_technologies,
        reasoning,
        confidence,
    })
}

fn coerce_confidence(value: Option<&Value>) -> Result<u8, String> {
    let value = value.ok_or_else(|| "field `confidence` missing".to_string())?;
    let number = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| "field `confidence` is not a finite number".to_string())?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("field `confidence` is not numeric: {s:?}"))?,
        _ => return Err("field `confidence` has a non-numeric type".to_string()),
    };
    let rounded = number.round();
    if !(0.0..=100.0).contains(&rounded) {
        return Err(format!("confidence {number} outside 0..=100"));
    }
    Ok(rounded as u8)
}

/// Same prompt each attempt; after the retry budget the report is dropped,
/// never persisted partially.
pub fn generate_report(
    model: &dyn ChatModel,
    system: &str,
    prompt: &str,
    max_retries: u32,
) -> Result<ReportSections, GenerationError> {
    let attempts = max_retries + 1;
    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        match model.complete_json(system, prompt) {
            Ok(raw) => match parse_report_json(&raw) {
                Ok(sections) => return Ok(sections),
                Err(reason) => {
                    log::warn!(
                        "generation attempt {attempt}/{attempts}: output rejected: {reason}"
                    );
                    last_reason = reason;
                }
            },
            Err(err) => {
                log::warn!("generation attempt {attempt}/{attempts}: model call failed: {err}");
                last_reason = err.to_string();
            }
        }
    }
    Err(GenerationError {
        attempts,
        reason: last_reason,
    })
}

fn stat_line(stat: &CivilizationStat) -> String {
    format!(
        "- {}: {:.2}% WR, {:.2}% PR, {} games",
        stat.civilization, stat.win_rate, stat.pick_rate, stat.games_count
    )
}

/// `top` is expected in descending win-rate order, `bottom` ascending.
pub fn build_meta_prompt(
    top: &[CivilizationStat],
    bottom: &[CivilizationStat],
    patch: &str,
) -> String {
    let top_lines = top.iter().map(stat_line).collect::<Vec<_>>().join("\n");
    let bottom_lines = bottom.iter().map(stat_line).collect::<Vec<_>>().join("\n");

    format!(
        "You are an expert Age of Empires 4 meta analyst. Analyze the current competitive \
meta based on live statistics from ranked 1v1 games.

**Top {} Performing Civilizations:**
{top_lines}

**Bottom {} Performing Civilizations:**
{bottom_lines}

**Patch:** {patch}

Provide a comprehensive meta analysis including:
1. Why the top civilizations are dominating
2. What strategies they enable
3. How to counter the meta picks
4. Which underperforming civs might be sleeper picks
5. Predictions for meta shifts

Format as JSON:
{{
  \"early_game\": \"Early game meta analysis\",
  \"mid_game\": \"Mid game meta trends\",
  \"late_game\": \"Late game considerations\",
  \"key_units\": \"Most important units in current meta\",
  \"key_technologies\": \"Critical technologies\",
  \"confidence\": 90,
  \"reasoning\": \"Detailed reasoning for the analysis\"
}}",
        top.len(),
        bottom.len()
    )
}

pub fn build_civ_guide_prompt(stat: &CivilizationStat, rank: usize, total: usize) -> String {
    format!(
        "You are an expert Age of Empires 4 coach. Create a guide for playing {name} in the \
current competitive meta.

**{name} Statistics:**
- Win Rate: {win:.2}%
- Pick Rate: {pick:.2}%
- Meta Ranking: #{rank} out of {total}
- Average Game Duration: {duration} seconds
- Patch: {patch}

Provide practical advice for:
1. Early game priorities (first 10 minutes)
2. Mid game power spikes and strategies
3. Late game compositions
4. Key matchups to be aware of
5. Why this civ is performing at this level

Format as JSON:
{{
  \"early_game\": \"Early game strategy\",
  \"mid_game\": \"Mid game approach\",
  \"late_game\": \"Late game plan\",
  \"key_units\": \"Units to prioritize\",
  \"key_technologies\": \"Technologies to research\",
  \"confidence\": 85,
  \"reasoning\": \"Why this approach works\"
}}",
        name = stat.civilization,
        win = stat.win_rate,
        pick = stat.pick_rate,
        duration = stat.avg_game_duration,
        patch = stat.patch,
    )
}
