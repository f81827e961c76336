pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod openai_responses;
