pub mod admin;
pub mod datasets;
pub mod health;
