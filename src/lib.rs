pub mod debuginfo_store;
pub mod filter;
pub mod options;
pub mod pipeline;
pub mod processor;
pub mod profile;
pub mod symbolizer;
pub mod symbols;
pub mod trace;
