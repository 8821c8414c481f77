pub mod executor;
pub mod protocol;
pub mod session;
