pub mod bedrock;
pub mod openai;

pub use bedrock::{BedrockProvider, LazyBedrockProvider};
pub use openai::OpenAiProvider;
