pub mod delete;
pub mod get;
pub mod head;
pub mod put;
