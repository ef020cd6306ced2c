pub mod api;
pub mod assets;
pub mod battle;
pub mod capture;
pub mod config;
pub mod detector;
pub mod input;
pub mod interaction;
pub mod state;
pub mod window;
