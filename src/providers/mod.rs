pub mod base;
pub mod scripted;

pub use base::{
    AgentProfile, Message, ModelEvent, ModelEventStream, ModelRequest, ModelRequestService,
    ToolCallRequest,
};
