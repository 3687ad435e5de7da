//! Wire Protocol Module
//!
//! Line-oriented text protocol spoken between the coordinator and its workers.
//!
//! ## Format
//! Every message is one newline-terminated line: a three-letter command code,
//! optionally followed by fields, each introduced by the `*|*` separator
//! (`SRH*|*needle*|*AbCdEfGhIjKlM`). Lists of chunk names travel inside a single
//! field joined by `--`.
//!
//! Field values must not contain the separator themselves. The codec does not
//! check this.

pub mod codec;
pub mod types;

pub use codec::{decode, encode, join_names, split_names, write_messages};
pub use types::{Command, Message, ProtocolError};
