pub mod common;
pub mod info;
pub mod layout;
pub mod probe;
