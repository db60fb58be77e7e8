pub mod dispatch;
pub mod request;
pub mod response;
pub mod server;
pub mod tls;
