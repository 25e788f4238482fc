pub mod ollama;
pub mod sqlite;
