//! Parsing of Claude CLI `stream-json` output

mod normalize;
mod parser;

pub use normalize::normalize;
pub use parser::parse_message;
