pub mod executor;
pub mod interpreter;
pub mod intent_router;
pub mod llm_gateway;
pub mod memory;
pub mod paths;
pub mod plan;
pub mod postprocess;
pub mod reasoning;
pub mod session;
pub mod skills;
pub mod task_source;
mod text;
pub mod usage;
pub mod worker;

pub use worker::{Bridge, Reply};
