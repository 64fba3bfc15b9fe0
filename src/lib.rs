//! Script-driven editor tabs for intercepted HTTP traffic.
//!
//! A user script exposes callbacks named `<kind>_edit_<in|out>[_<channel>]`. Each channel
//! becomes an editor tab that decodes part of a request or response into editable text and
//! encodes the edited text back into the message.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod editor;
pub mod error;
pub mod http;
pub mod intercept;
pub mod logger;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod script;
pub mod watcher;
