//! Tipos de dados do endpoint `v1/messages` da Anthropic.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    /// Instrução de sistema; omitida do JSON quando ausente.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

impl MessagesRequest {
    /// Requisição de uma única mensagem de usuário.
    pub fn single(model: &str, max_tokens: u32, system: &str, content: String) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            system: Some(system.to_string()),
            messages: vec![Message {
                role: "user".into(),
                content,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "user" ou "assistant".
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatena os blocos de texto da resposta.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Trecho do primeiro `{` ao último `}`, tolerando cercas de markdown e
/// texto ao redor do objeto JSON.
pub fn extract_json_object(text: &str) -> Option<&str> {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    }
}

/// Bloco de conteúdo; `content_type` é serializado como `"type"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
