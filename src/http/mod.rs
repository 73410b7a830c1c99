//! HTTP/1.1 request parsing and response assembly.

pub mod parser;
pub mod request;
pub mod response;
