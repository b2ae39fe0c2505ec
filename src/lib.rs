pub mod budget;
pub mod platform;
