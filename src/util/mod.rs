pub mod format;
pub mod stop;
