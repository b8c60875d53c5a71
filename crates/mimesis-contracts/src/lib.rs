pub mod analysis;
pub mod events;
pub mod files;
pub mod receipts;
pub mod repl;
pub mod session;
