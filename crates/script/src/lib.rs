//! Script classification, evaluation, and signature verification.

pub mod interpreter;
pub mod opcodes;
pub mod secp;
pub mod sighash;
pub mod standard;

pub use interpreter::{verify_signature, ScriptError, ScriptFlags};
pub use standard::{solve, ScriptType};
