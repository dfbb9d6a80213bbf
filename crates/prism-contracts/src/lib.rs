pub mod chat;
pub mod events;
pub mod keys;
pub mod models;
pub mod requests;
pub mod session;
pub mod transcript;
