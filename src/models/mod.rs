pub mod anthropic;
pub mod azure_openai;
pub mod openai;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use azure_openai::AzureOpenAIProvider;
pub use openai::OpenAIProvider;
pub use provider::{
    FinishReason, GenerationRequest, GenerationResponse, Message, MessageRole, PriceTable, Provider,
    ProviderHealth, TokenUsage, HEALTH_CHECK_TIMEOUT,
};
