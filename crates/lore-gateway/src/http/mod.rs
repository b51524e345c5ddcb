pub mod auth;
pub mod chat;
pub mod documents;
pub mod health;
pub mod knowledge;
pub mod llms;
pub mod recall;
pub mod robots;
pub mod sessions;
pub mod users;
