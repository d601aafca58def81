use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// An ordered alternative `(provider, model)` attempted after a failure
/// that permits fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fallback {
    pub provider: String,
    pub model: String,
}

macro_rules! payload {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $name {
            pub provider: String,
            pub model: String,
            #[serde(default)]
            pub fallbacks: Vec<Fallback>,
            $(pub $field: $ty,)*
        }
    };
}

payload!(ChatPayload { messages: Json });
payload!(TextCompletionPayload { prompt: String });
payload!(ResponsesPayload { input: Json });
payload!(EmbeddingPayload { input: Json });
payload!(SpeechPayload { input: String, voice: String });
payload!(TranscriptionPayload { audio: bytes::Bytes });
payload!(ImageGenPayload { prompt: String });

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsPayload {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub fallbacks: Vec<Fallback>,
    #[serde(default)]
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Upload,
    List,
    Retrieve,
    Delete,
    Content,
}

payload!(FilePayload { op: FileOp, file_id: Option<String>, body: Option<bytes::Bytes> });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOp {
    Create,
    List,
    Retrieve,
    Cancel,
    Results,
}

payload!(BatchPayload { op: BatchOp, batch_id: Option<String>, body: Option<Json> });

/// One of the eight container-scoped operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerOp {
    Create,
    List,
    Retrieve,
    Delete,
    FileUpload,
    FileList,
    FileRetrieve,
    FileDelete,
}

payload!(ContainerPayload { op: ContainerOp, container_id: Option<String>, file_id: Option<String>, body: Option<Json> });

/// Tagged union over every request shape the router accepts.
/// Streaming and non-streaming chat/text/responses/speech/transcription/
/// image-gen share one payload type each; the `*Stream` variants carry the
/// same payload and differ only in how the worker invokes the provider
/// (`call` vs `call_stream`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TypedRequest {
    Chat(ChatPayload),
    ChatStream(ChatPayload),
    TextCompletion(TextCompletionPayload),
    TextCompletionStream(TextCompletionPayload),
    Responses(ResponsesPayload),
    ResponsesStream(ResponsesPayload),
    Embedding(EmbeddingPayload),
    Speech(SpeechPayload),
    SpeechStream(SpeechPayload),
    Transcription(TranscriptionPayload),
    TranscriptionStream(TranscriptionPayload),
    ImageGen(ImageGenPayload),
    ImageGenStream(ImageGenPayload),
    ListModels(ListModelsPayload),
    CountTokens(ChatPayload),
    File(FilePayload),
    Batch(BatchPayload),
    Container(ContainerPayload),
}

impl TypedRequest {
    /// The common accessor every variant exposes.
    pub fn provider(&self) -> &str {
        match self {
            TypedRequest::Chat(p) | TypedRequest::ChatStream(p) | TypedRequest::CountTokens(p) => {
                &p.provider
            }
            TypedRequest::TextCompletion(p) | TypedRequest::TextCompletionStream(p) => &p.provider,
            TypedRequest::Responses(p) | TypedRequest::ResponsesStream(p) => &p.provider,
            TypedRequest::Embedding(p) => &p.provider,
            TypedRequest::Speech(p) | TypedRequest::SpeechStream(p) => &p.provider,
            TypedRequest::Transcription(p) | TypedRequest::TranscriptionStream(p) => &p.provider,
            TypedRequest::ImageGen(p) | TypedRequest::ImageGenStream(p) => &p.provider,
            TypedRequest::ListModels(p) => &p.provider,
            TypedRequest::File(p) => &p.provider,
            TypedRequest::Batch(p) => &p.provider,
            TypedRequest::Container(p) => &p.provider,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            TypedRequest::Chat(p) | TypedRequest::ChatStream(p) | TypedRequest::CountTokens(p) => {
                &p.model
            }
            TypedRequest::TextCompletion(p) | TypedRequest::TextCompletionStream(p) => &p.model,
            TypedRequest::Responses(p) | TypedRequest::ResponsesStream(p) => &p.model,
            TypedRequest::Embedding(p) => &p.model,
            TypedRequest::Speech(p) | TypedRequest::SpeechStream(p) => &p.model,
            TypedRequest::Transcription(p) | TypedRequest::TranscriptionStream(p) => &p.model,
            TypedRequest::ImageGen(p) | TypedRequest::ImageGenStream(p) => &p.model,
            TypedRequest::ListModels(p) => &p.model,
            TypedRequest::File(p) => &p.model,
            TypedRequest::Batch(p) => &p.model,
            TypedRequest::Container(p) => &p.model,
        }
    }

    pub fn fallbacks(&self) -> &[Fallback] {
        match self {
            TypedRequest::Chat(p) | TypedRequest::ChatStream(p) | TypedRequest::CountTokens(p) => {
                &p.fallbacks
            }
            TypedRequest::TextCompletion(p) | TypedRequest::TextCompletionStream(p) => {
                &p.fallbacks
            }
            TypedRequest::Responses(p) | TypedRequest::ResponsesStream(p) => &p.fallbacks,
            TypedRequest::Embedding(p) => &p.fallbacks,
            TypedRequest::Speech(p) | TypedRequest::SpeechStream(p) => &p.fallbacks,
            TypedRequest::Transcription(p) | TypedRequest::TranscriptionStream(p) => &p.fallbacks,
            TypedRequest::ImageGen(p) | TypedRequest::ImageGenStream(p) => &p.fallbacks,
            TypedRequest::ListModels(p) => &p.fallbacks,
            TypedRequest::File(p) => &p.fallbacks,
            TypedRequest::Batch(p) => &p.fallbacks,
            TypedRequest::Container(p) => &p.fallbacks,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            TypedRequest::ChatStream(_)
                | TypedRequest::TextCompletionStream(_)
                | TypedRequest::ResponsesStream(_)
                | TypedRequest::SpeechStream(_)
                | TypedRequest::TranscriptionStream(_)
                | TypedRequest::ImageGenStream(_)
        )
    }

    /// Name used in error `ExtraFields.requestType` and in trace span
    /// attributes.
    pub fn type_name(&self) -> &'static str {
        match self {
            TypedRequest::Chat(_) => "chat",
            TypedRequest::ChatStream(_) => "chat_stream",
            TypedRequest::TextCompletion(_) => "text_completion",
            TypedRequest::TextCompletionStream(_) => "text_completion_stream",
            TypedRequest::Responses(_) => "responses",
            TypedRequest::ResponsesStream(_) => "responses_stream",
            TypedRequest::Embedding(_) => "embedding",
            TypedRequest::Speech(_) => "speech",
            TypedRequest::SpeechStream(_) => "speech_stream",
            TypedRequest::Transcription(_) => "transcription",
            TypedRequest::TranscriptionStream(_) => "transcription_stream",
            TypedRequest::ImageGen(_) => "image_gen",
            TypedRequest::ImageGenStream(_) => "image_gen_stream",
            TypedRequest::ListModels(_) => "list_models",
            TypedRequest::CountTokens(_) => "count_tokens",
            TypedRequest::File(_) => "file",
            TypedRequest::Batch(_) => "batch",
            TypedRequest::Container(_) => "container",
        }
    }

    /// Validates the variant-specific mandatory payload field. Returns
    /// the name of the missing field on failure.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.provider().is_empty() {
            return Err("provider");
        }
        match self {
            TypedRequest::Chat(p) | TypedRequest::ChatStream(p) | TypedRequest::CountTokens(p) => {
                if p.messages.is_null() {
                    return Err("messages");
                }
            }
            TypedRequest::TextCompletion(p) | TypedRequest::TextCompletionStream(p) => {
                if p.prompt.is_empty() {
                    return Err("prompt");
                }
            }
            TypedRequest::Responses(p) | TypedRequest::ResponsesStream(p) => {
                if p.input.is_null() {
                    return Err("input");
                }
            }
            TypedRequest::Embedding(p) => {
                if p.input.is_null() {
                    return Err("input");
                }
            }
            TypedRequest::Speech(p) | TypedRequest::SpeechStream(p) => {
                if p.input.is_empty() {
                    return Err("input");
                }
            }
            TypedRequest::Transcription(p) | TypedRequest::TranscriptionStream(p) => {
                if p.audio.is_empty() {
                    return Err("audio");
                }
            }
            TypedRequest::ImageGen(p) | TypedRequest::ImageGenStream(p) => {
                if p.prompt.is_empty() {
                    return Err("prompt");
                }
            }
            TypedRequest::ListModels(_) => {}
            TypedRequest::File(p) => {
                if matches!(p.op, FileOp::Upload) && p.body.as_ref().is_none_or(|b| b.is_empty()) {
                    return Err("body");
                }
            }
            TypedRequest::Batch(_) | TypedRequest::Container(_) => {}
        }
        Ok(())
    }

    /// A shallow copy with `provider`/`model` replaced, used when building
    /// a fallback sub-request.
    pub fn with_provider_model(&self, provider: &str, model: &str) -> TypedRequest {
        let mut clone = self.clone();
        macro_rules! set {
            ($p:expr) => {{
                $p.provider = provider.to_string();
                $p.model = model.to_string();
            }};
        }
        match &mut clone {
            TypedRequest::Chat(p) | TypedRequest::ChatStream(p) | TypedRequest::CountTokens(p) => {
                set!(p)
            }
            TypedRequest::TextCompletion(p) | TypedRequest::TextCompletionStream(p) => set!(p),
            TypedRequest::Responses(p) | TypedRequest::ResponsesStream(p) => set!(p),
            TypedRequest::Embedding(p) => set!(p),
            TypedRequest::Speech(p) | TypedRequest::SpeechStream(p) => set!(p),
            TypedRequest::Transcription(p) | TypedRequest::TranscriptionStream(p) => set!(p),
            TypedRequest::ImageGen(p) | TypedRequest::ImageGenStream(p) => set!(p),
            TypedRequest::ListModels(p) => set!(p),
            TypedRequest::File(p) => set!(p),
            TypedRequest::Batch(p) => set!(p),
            TypedRequest::Container(p) => set!(p),
        }
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_provider() {
        let req = TypedRequest::Chat(ChatPayload {
            provider: String::new(),
            model: "gpt-4o".into(),
            fallbacks: vec![],
            messages: serde_json::json!([{"role": "user", "content": "hi"}]),
        });
        assert_eq!(req.validate(), Err("provider"));
    }

    #[test]
    fn validate_rejects_null_messages() {
        let req = TypedRequest::Chat(ChatPayload {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            fallbacks: vec![],
            messages: Json::Null,
        });
        assert_eq!(req.validate(), Err("messages"));
    }

    #[test]
    fn with_provider_model_replaces_only_those_fields() {
        let req = TypedRequest::Chat(ChatPayload {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            fallbacks: vec![Fallback {
                provider: "anthropic".into(),
                model: "claude".into(),
            }],
            messages: serde_json::json!([]),
        });
        let next = req.with_provider_model("anthropic", "claude");
        assert_eq!(next.provider(), "anthropic");
        assert_eq!(next.model(), "claude");
        assert_eq!(next.fallbacks().len(), 1);
    }
}
