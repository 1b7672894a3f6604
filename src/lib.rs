pub mod accumulator;
pub mod compiler;
pub mod config;
pub mod encoding;
pub mod error;
pub mod image_source;
pub mod plan;
pub mod scenario;
pub mod schema;
pub mod segment;
pub mod synthesis;
pub mod temp;
