pub mod constants;
pub mod domain;
pub mod errors;
pub mod layout;
