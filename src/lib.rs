//! peerchat - peer-to-peer TCP chat endpoint
//!
//! This crate is the console side of peerchat: command parsing, the
//! interactive console and startup settings. The connection engine lives in
//! `peerchat-net`; shared types in `peerchat-core`.

pub mod command;
pub mod console;
pub mod settings;

pub use command::{Command, CommandError};
pub use console::Console;
pub use settings::{Settings, SettingsError};
