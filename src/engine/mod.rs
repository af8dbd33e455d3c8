pub mod backend;
pub mod cache_store;
pub mod comparison;
pub mod engine;
pub mod figures;
pub mod inline_eval;
pub mod kernel_client;
pub mod protocol;
pub mod term;
