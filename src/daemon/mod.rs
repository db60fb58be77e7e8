pub mod http;
pub mod scratch;
pub mod signer;
pub mod start;
pub mod supervisor;
pub mod tool;
