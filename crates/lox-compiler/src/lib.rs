//! lox-compiler — scanner et compilateur Pratt une-seule-passe pour Lox.
//!
//! Pas d'AST intermédiaire : [`compile`] lit directement le flux de tokens
//! et émet le bytecode ([`lox_core::Chunk`]/[`lox_core::Op`]) au fur et à
//! mesure, comme le ferait un compilateur à une passe sur une machine à
//! pile. Les chaînes et noms (globales, champs, méthodes) sont internés
//! dans le [`lox_core::Heap`] fourni par l'appelant.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod compiler;
mod error;
mod scanner;
mod token;

pub use compiler::compile;
pub use error::{CompileError, ErrorLocation};
