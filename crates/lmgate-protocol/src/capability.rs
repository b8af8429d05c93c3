use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Provider family an upstream speaks. A single upstream never mixes
/// families; the config validator enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    OpenAi,
    Anthropic,
    Google,
    Custom,
}

impl ProviderFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderFamily::OpenAi => "openai",
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Google => "google",
            ProviderFamily::Custom => "custom",
        }
    }
}

/// How the upstream credential is attached to an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-api-key: <key>`
    XApiKey,
    /// `?key=<key>` query parameter
    QueryKey,
}

/// A (provider family, operation) tag. Requests require one, upstreams
/// advertise a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    OpenAiChatCompletions,
    OpenAiResponses,
    OpenAiEmbeddings,
    AnthropicMessages,
    AnthropicCountTokens,
    GoogleGenerateContent,
    GoogleStreamGenerateContent,
    /// Escape hatch for bespoke upstreams; the operation name is free-form.
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityParseError(pub String);

impl fmt::Display for CapabilityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown capability: {}", self.0)
    }
}

impl std::error::Error for CapabilityParseError {}

impl Capability {
    pub fn family(&self) -> ProviderFamily {
        match self {
            Capability::OpenAiChatCompletions
            | Capability::OpenAiResponses
            | Capability::OpenAiEmbeddings => ProviderFamily::OpenAi,
            Capability::AnthropicMessages | Capability::AnthropicCountTokens => {
                ProviderFamily::Anthropic
            }
            Capability::GoogleGenerateContent | Capability::GoogleStreamGenerateContent => {
                ProviderFamily::Google
            }
            Capability::Custom(_) => ProviderFamily::Custom,
        }
    }

    /// Auth scheme is a property of the family, not the operation.
    pub fn auth_scheme(&self) -> AuthScheme {
        match self.family() {
            ProviderFamily::OpenAi | ProviderFamily::Custom => AuthScheme::Bearer,
            ProviderFamily::Anthropic => AuthScheme::XApiKey,
            ProviderFamily::Google => AuthScheme::QueryKey,
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            Capability::OpenAiChatCompletions => "openai.chat_completions".to_string(),
            Capability::OpenAiResponses => "openai.responses".to_string(),
            Capability::OpenAiEmbeddings => "openai.embeddings".to_string(),
            Capability::AnthropicMessages => "anthropic.messages".to_string(),
            Capability::AnthropicCountTokens => "anthropic.count_tokens".to_string(),
            Capability::GoogleGenerateContent => "google.generate_content".to_string(),
            Capability::GoogleStreamGenerateContent => {
                "google.stream_generate_content".to_string()
            }
            Capability::Custom(op) => format!("custom.{op}"),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CapabilityParseError> {
        match raw {
            "openai.chat_completions" => Ok(Capability::OpenAiChatCompletions),
            "openai.responses" => Ok(Capability::OpenAiResponses),
            "openai.embeddings" => Ok(Capability::OpenAiEmbeddings),
            "anthropic.messages" => Ok(Capability::AnthropicMessages),
            "anthropic.count_tokens" => Ok(Capability::AnthropicCountTokens),
            "google.generate_content" => Ok(Capability::GoogleGenerateContent),
            "google.stream_generate_content" => Ok(Capability::GoogleStreamGenerateContent),
            other => match other.strip_prefix("custom.") {
                Some(op) if !op.is_empty() => Ok(Capability::Custom(op.to_string())),
                _ => Err(CapabilityParseError(other.to_string())),
            },
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Capability::parse(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_string_form() {
        for cap in [
            Capability::OpenAiChatCompletions,
            Capability::AnthropicMessages,
            Capability::GoogleStreamGenerateContent,
            Capability::Custom("rerank".to_string()),
        ] {
            assert_eq!(Capability::parse(&cap.as_str()).unwrap(), cap);
        }
    }

    #[test]
    fn rejects_unknown_and_bare_custom() {
        assert!(Capability::parse("openai.images").is_err());
        assert!(Capability::parse("custom.").is_err());
    }

    #[test]
    fn auth_scheme_follows_family() {
        assert_eq!(
            Capability::OpenAiResponses.auth_scheme(),
            AuthScheme::Bearer
        );
        assert_eq!(
            Capability::AnthropicMessages.auth_scheme(),
            AuthScheme::XApiKey
        );
        assert_eq!(
            Capability::GoogleGenerateContent.auth_scheme(),
            AuthScheme::QueryKey
        );
    }
}
