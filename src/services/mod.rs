pub mod checkpoint_store;
pub mod emitter;
pub mod export;
pub mod invoker;
pub mod job;
pub mod llm;
pub mod parser;
pub mod prompt;
pub mod providers;
pub mod scheduler;
