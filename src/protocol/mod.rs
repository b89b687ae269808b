//! The engine's boundary: frames and their codec, the transport abstraction, and the command
//!  table contract.

pub mod command_table;
pub mod frame;
pub mod result_codes;
pub mod transport;
