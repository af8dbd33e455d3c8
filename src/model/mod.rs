pub mod cache_record;
pub mod chunk;
pub mod options;
pub mod output;
