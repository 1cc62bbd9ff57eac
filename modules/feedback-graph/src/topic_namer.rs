use ai_client::{strip_code_blocks, truncate_to_char_boundary, OpenAi};
use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::cluster::TopicNamer;

/// Members sent to the model per cluster.
const MAX_MEMBERS_IN_PROMPT: usize = 15;

const MAX_NAME_LEN: usize = 80;

const SYSTEM_PROMPT: &str =
    "You name groups of customer feedback for a business owner. Respond only with valid JSON.";

/// Topic names from a chat model.
pub struct LlmTopicNamer {
    client: OpenAi,
}

impl LlmTopicNamer {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: OpenAi::new(api_key, model),
        }
    }
}

#[async_trait]
impl TopicNamer for LlmTopicNamer {
    async fn name_topic(&self, member_texts: &[String]) -> Result<String> {
        let response = self
            .client
            .chat_completion(SYSTEM_PROMPT, build_prompt(member_texts))
            .await?;
        parse_name(&response)
    }
}

fn build_prompt(member_texts: &[String]) -> String {
    let listed: Vec<String> = member_texts
        .iter()
        .take(MAX_MEMBERS_IN_PROMPT)
        .map(|t| format!("- {t}"))
        .collect();

    format!(
        r#"These pieces of customer feedback were grouped by semantic similarity.

Feedback in this group:
{}

Give the group a short, specific topic name (max {MAX_NAME_LEN} chars) that a business owner would recognise, such as "Long wait for tables on weekends". Avoid generic labels like "Service".

Respond in this exact JSON format:
{{"name": "..."}}"#,
        listed.join("\n")
    )
}

fn parse_name(response: &str) -> Result<String> {
    let parsed: serde_json::Value = serde_json::from_str(strip_code_blocks(response))?;
    let name = parsed["name"]
        .as_str()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| anyhow!("topic name missing from response: {response}"))?;
    Ok(truncate_to_char_boundary(name, MAX_NAME_LEN).to_string())
}
