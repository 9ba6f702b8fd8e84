//! Outbound text formatting.
//!
//! Assistant output goes through three stages before it reaches the chat:
//! media-tag extraction ([`media`]), markdown to Telegram-HTML conversion
//! ([`html`]), and length-limited splitting ([`split`]).

pub mod html;
pub mod media;
pub mod split;
