// Request/response conversion between the Claude Messages format and the
// Kiro conversationState envelope

pub mod claude_to_kiro;

pub use claude_to_kiro::build_kiro_request;
