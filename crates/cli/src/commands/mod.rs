pub mod ip;
pub mod location;
pub mod token;
