//! Typed SSE event structures for provider responses.
//!
//! Parse errors happen at the serde boundary, not scattered through parsing logic.
//! Each provider module defines an event type plus supporting structs, with
//! `#[serde(default)]` on optional fields and an `Unknown` catch-all so new
//! event types never break an in-flight stream.

pub mod openai {
    use serde::Deserialize;

    /// Top-level Responses API SSE event, tagged by `type` field.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum Event {
        #[serde(rename = "response.created")]
        Created { response: Option<ResponseInfo> },
        #[serde(rename = "response.output_item.added")]
        OutputItemAdded {
            #[serde(alias = "output_item")]
            item: Option<OutputItem>,
        },
        #[serde(rename = "response.output_text.delta")]
        OutputTextDelta { delta: Option<String> },
        #[serde(rename = "response.function_call_arguments.delta")]
        FunctionCallArgumentsDelta {
            item_id: Option<String>,
            delta: Option<String>,
        },
        #[serde(rename = "response.function_call_arguments.done")]
        FunctionCallArgumentsDone {
            item_id: Option<String>,
            call_id: Option<String>,
            name: Option<String>,
            arguments: Option<String>,
        },
        #[serde(rename = "response.completed")]
        Completed { response: Option<ResponseInfo> },
        #[serde(rename = "response.incomplete")]
        Incomplete { response: Option<ResponseInfo> },
        #[serde(rename = "response.failed")]
        Failed {
            response: Option<ResponseInfo>,
            error: Option<ErrorInfo>,
        },
        #[serde(rename = "error")]
        Error {
            error: Option<ErrorInfo>,
            message: Option<String>,
        },
        /// Unknown event type - forward compatibility
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum OutputItem {
        #[serde(rename = "function_call")]
        FunctionCall {
            id: Option<String>,
            call_id: Option<String>,
            name: Option<String>,
        },
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    pub struct ResponseInfo {
        pub id: Option<String>,
        pub usage: Option<Usage>,
        pub error: Option<ErrorInfo>,
        pub incomplete_details: Option<IncompleteDetails>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Usage {
        #[serde(default)]
        pub input_tokens: u32,
        #[serde(default)]
        pub output_tokens: u32,
        pub output_tokens_details: Option<OutputTokensDetails>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct OutputTokensDetails {
        #[serde(default)]
        pub reasoning_tokens: u32,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        pub message: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct IncompleteDetails {
        pub reason: Option<String>,
    }

}

pub mod gemini {
    use serde::Deserialize;

    /// Each Gemini SSE chunk is a complete response object with candidates.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Response {
        pub response_id: Option<String>,
        pub candidates: Option<Vec<Candidate>>,
        pub error: Option<ErrorInfo>,
        pub usage_metadata: Option<UsageMetadata>,
    }

    /// Token usage reported so far. Later chunks supersede earlier ones.
    #[derive(Debug, Deserialize, Default, Clone, Copy)]
    #[serde(rename_all = "camelCase")]
    pub struct UsageMetadata {
        #[serde(default)]
        pub prompt_token_count: u32,
        #[serde(default)]
        pub candidates_token_count: u32,
        #[serde(default)]
        pub thoughts_token_count: u32,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Candidate {
        pub content: Option<Content>,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Content {
        pub parts: Option<Vec<Part>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Part {
        pub text: Option<String>,
        #[serde(default)]
        pub thought: bool,
        pub function_call: Option<FunctionCall>,
    }

    #[derive(Debug, Deserialize)]
    pub struct FunctionCall {
        pub name: Option<String>,
        pub args: Option<serde_json::Value>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        pub message: Option<String>,
    }

    /// Entry in the model listing.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Model {
        pub name: String,
        pub display_name: Option<String>,
        pub input_token_limit: Option<u32>,
        #[serde(default)]
        pub supported_generation_methods: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ModelList {
        #[serde(default)]
        pub models: Vec<Model>,
    }

    /// Known Gemini finish reasons.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FinishReason {
        Stop,
        MaxTokens,
        Safety,
        Recitation,
        Blocklist,
        ProhibitedContent,
        MalformedFunctionCall,
        Other,
        Unknown,
    }

    impl FinishReason {
        #[must_use]
        pub fn parse(s: &str) -> Self {
            match s {
                "STOP" => Self::Stop,
                "MAX_TOKENS" => Self::MaxTokens,
                "SAFETY" => Self::Safety,
                "RECITATION" => Self::Recitation,
                "BLOCKLIST" => Self::Blocklist,
                "PROHIBITED_CONTENT" => Self::ProhibitedContent,
                "MALFORMED_FUNCTION_CALL" => Self::MalformedFunctionCall,
                "OTHER" => Self::Other,
                _ => Self::Unknown,
            }
        }

        /// Error message for abnormal terminations, `None` for normal ones.
        #[must_use]
        pub fn error_message(self) -> Option<&'static str> {
            match self {
                Self::Stop | Self::MaxTokens | Self::Unknown => None,
                Self::Safety => Some("Content filtered by safety settings"),
                Self::Recitation => Some("Response blocked: recitation"),
                Self::Blocklist => Some("Response blocked: blocklist"),
                Self::ProhibitedContent => Some("Response blocked: prohibited content"),
                Self::MalformedFunctionCall => Some("Model produced a malformed function call"),
                Self::Other => Some("Response stopped for an unspecified reason"),
            }
        }
    }

}
