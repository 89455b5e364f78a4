pub mod backup_exchange;
pub mod catalog;
pub mod core;
pub mod evidence;
pub mod sheets;
