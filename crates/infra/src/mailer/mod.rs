pub mod fake;
pub mod smtp;
