pub mod build;
pub mod install;
pub mod state;
pub mod verify;
