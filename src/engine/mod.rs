// SIGPORT — ENGINE
pub mod payload;
pub mod runtime;
pub mod spsc;
pub mod wire;
