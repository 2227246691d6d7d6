pub mod parameter;
pub mod protocol;
pub mod registry;
