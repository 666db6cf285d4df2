//! Chat-completions wire types and the analysis result.
//!
//! The request is a single user message with a text part and an image-URL
//! part; the image travels as its data URL. The response is the usual
//! `choices[0].message.content` envelope plus a `usage` object.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'static str,
    pub content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl<'a> {
    pub url: &'a str,
}

impl<'a> ChatRequest<'a> {
    /// One user turn: the prompt followed by the image.
    pub fn vision(
        model: &'a str,
        prompt: &'a str,
        image_data_url: &'a str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_data_url,
                        },
                    },
                ],
            }],
            max_tokens,
            temperature,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// Token accounting reported by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, alias = "prompt_tokens")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    pub completion_tokens: u64,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u64,
}

/// A successful analysis: the model's text plus optional usage accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub analysis: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// The first choice's text, if there is one.
    pub fn into_result(self) -> Option<AnalysisResult> {
        let analysis = self.choices.into_iter().next()?.message.content?;
        Some(AnalysisResult {
            analysis,
            usage: self.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_text_then_image() {
        let req = ChatRequest::vision("m", "what is this", "data:image/png;base64,AAAA", 1500, 0.7);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["max_tokens"], 1500);
        let content = &json["messages"][0]["content"];
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "what is this");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn response_yields_first_choice_and_usage() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "A bar chart."}},
                {"index": 1, "message": {"role": "assistant", "content": "ignored"}}
            ],
            "usage": {"prompt_tokens": 812, "completion_tokens": 40, "total_tokens": 852, "queue_time": 0.01}
        }"#;
        let resp: ChatResponse = serde_json::from_str(body).unwrap();
        let result = resp.into_result().unwrap();
        assert_eq!(result.analysis, "A bar chart.");
        assert_eq!(
            result.usage,
            Some(Usage {
                prompt_tokens: 812,
                completion_tokens: 40,
                total_tokens: 852
            })
        );
    }

    #[test]
    fn empty_choices_yield_nothing() {
        let resp: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(resp.into_result().is_none());
    }
}
