pub mod coordinator;
pub mod gateway;
pub mod identity;
pub mod llm;
pub mod narrator;
pub mod setup;
pub mod validator;
pub mod workflow;
