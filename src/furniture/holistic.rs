use crate::furniture::attributes::AttributeRecord;
use crate::llm::{ChatModel, LlmError, LlmMessage, parse_json_reply};
use async_trait::async_trait;
use serde::Deserialize;
use std::{fmt::Write as _, sync::Arc};
use thiserror::Error;

/// One-shot partition of a whole batch, proposed by a model.
///
/// Indices are positions in the slice handed to [`HolisticGrouper::propose`].
/// The proposal is untrusted: the grouping engine validates it before use.
#[async_trait]
pub trait HolisticGrouper: Send + Sync {
    async fn propose(&self, records: &[AttributeRecord]) -> Result<HolisticProposal, HolisticError>;
}

#[derive(Debug, Error)]
pub enum HolisticError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("grouper unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HolisticProposal {
    #[serde(default)]
    pub groups: Vec<ProposedGroup>,
    #[serde(default)]
    pub total_groups: Option<usize>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProposedGroup {
    #[serde(default)]
    pub image_indices: Vec<usize>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub furniture_description: Option<String>,
}

impl ProposedGroup {
    pub fn of(indices: &[usize]) -> Self {
        Self {
            image_indices: indices.to_vec(),
            ..Self::default()
        }
    }
}

pub struct LlmHolisticGrouper {
    model: Arc<dyn ChatModel>,
    function_name: String,
}

impl LlmHolisticGrouper {
    pub fn new(model: Arc<dyn ChatModel>, function_name: impl Into<String>) -> Self {
        Self {
            model,
            function_name: function_name.into(),
        }
    }
}

#[async_trait]
impl HolisticGrouper for LlmHolisticGrouper {
    async fn propose(&self, records: &[AttributeRecord]) -> Result<HolisticProposal, HolisticError> {
        let prompt = grouping_prompt(records);
        let reply = self
            .model
            .chat(&self.function_name, &[LlmMessage::user(prompt)])
            .await?;
        Ok(parse_json_reply(&reply.text)?)
    }
}

fn grouping_prompt(records: &[AttributeRecord]) -> String {
    let mut prompt = String::from(
        "You are sorting photos for furniture resale listings. Each line below describes one \
         photo. Several photos may show the same physical item from different angles. Group the \
         photos so that each group is exactly one physical piece of furniture. Be conservative: \
         only group photos when type, color and material clearly agree.\n\n",
    );
    for (position, record) in records.iter().enumerate() {
        let features = record
            .features
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            prompt,
            "Image {position}: type={}, color={}, material={}, style={}, condition={}, features=[{}]",
            record.furniture_type.as_deref().unwrap_or("unknown"),
            record.primary_color.as_deref().unwrap_or("unknown"),
            record.material.as_deref().unwrap_or("unknown"),
            record.style.as_deref().unwrap_or("unknown"),
            record.condition.map(|c| c.label()).unwrap_or("unknown"),
            features,
        );
    }
    let _ = write!(
        prompt,
        "\nEvery image index from 0 to {} must appear in exactly one group. Reply with JSON only:\n\
         {{\"groups\": [{{\"group_id\": \"group_1\", \"image_indices\": [0, 2], \
         \"reasoning\": \"...\", \"furniture_description\": \"...\"}}], \
         \"total_groups\": 1, \"confidence\": 0.9}}",
        records.len().saturating_sub(1)
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use std::sync::Mutex;

    struct ScriptedModel {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(
            &self,
            function_name: &str,
            messages: &[LlmMessage],
        ) -> Result<LlmResponse, LlmError> {
            assert_eq!(function_name, "furniture_grouping");
            let body = serde_json::to_string(messages).unwrap();
            self.prompts.lock().unwrap().push(body);
            Ok(LlmResponse {
                text: self.reply.clone(),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn parses_fenced_proposal_and_lists_every_image() {
        let model = Arc::new(ScriptedModel {
            reply: "```json\n{\"groups\":[{\"group_id\":\"sofa\",\"image_indices\":[1,0],\
                    \"reasoning\":\"same sofa\"},{\"image_indices\":[2]}],\"total_groups\":2}\n```"
                .into(),
            prompts: Mutex::new(Vec::new()),
        });
        let grouper = LlmHolisticGrouper::new(model.clone(), "furniture_grouping");
        let records = vec![
            AttributeRecord::new(0, "a.jpg").with_type("Sofa"),
            AttributeRecord::new(1, "b.jpg").with_type("Sofa"),
            AttributeRecord::new(2, "c.jpg").with_type("Lamp"),
        ];
        let proposal = grouper.propose(&records).await.expect("proposal");
        assert_eq!(proposal.groups.len(), 2);
        assert_eq!(proposal.groups[0].image_indices, vec![1, 0]);
        assert_eq!(proposal.groups[0].reasoning.as_deref(), Some("same sofa"));
        assert_eq!(proposal.total_groups, Some(2));

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("Image 0: type=Sofa"));
        assert!(prompts[0].contains("Image 2: type=Lamp"));
        assert!(prompts[0].contains("from 0 to 2"));
    }

    #[tokio::test]
    async fn negative_indices_are_a_parse_failure() {
        let model = Arc::new(ScriptedModel {
            reply: r#"{"groups":[{"image_indices":[-1]}]}"#.into(),
            prompts: Mutex::new(Vec::new()),
        });
        let grouper = LlmHolisticGrouper::new(model, "furniture_grouping");
        let records = vec![AttributeRecord::new(0, "a.jpg")];
        assert!(grouper.propose(&records).await.is_err());
    }
}
