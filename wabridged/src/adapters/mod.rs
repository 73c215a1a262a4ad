pub mod evolution;
pub mod session;
