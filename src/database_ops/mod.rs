pub mod stadia;
pub mod store;
