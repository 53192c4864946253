pub mod health;
pub mod preferences;
pub mod stream;
