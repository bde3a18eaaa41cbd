pub mod cipher;
pub mod config;
pub mod history;
pub mod sync;
pub mod vault;
