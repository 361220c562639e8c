//! lox-vm — machine virtuelle à pile qui exécute le bytecode `lox-core`.
//!
//! Ce crate ne dépend que de `lox-core` en production : il ne sait pas
//! compiler du source Lox, seulement exécuter un graphe d'objets déjà en
//! tas (typiquement produit par `lox-compiler`, utilisé ici uniquement en
//! dev-dependency pour les tests).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod error;
mod natives;
mod vm;

pub use error::{RuntimeError, TraceFrame};
pub use vm::{Vm, VmOptions};
