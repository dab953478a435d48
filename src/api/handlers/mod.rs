pub mod cleanup;
pub mod download;
pub mod health;
pub mod tus;
