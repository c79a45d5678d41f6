pub mod event_store;
pub mod lockfile;
pub mod state_files;
