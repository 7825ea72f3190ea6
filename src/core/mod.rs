pub mod retry;
pub mod settings;
