pub mod download;
pub mod gc;
pub mod pipeline;
pub mod promotion;
pub mod session_store;
pub mod staging;
pub mod upload_service;
pub mod worker;
