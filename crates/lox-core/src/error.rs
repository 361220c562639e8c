//! error.rs — erreurs internes au cœur du langage (pas les diagnostics
//! utilisateur de compilation/exécution, qui sont du ressort de
//! `lox-compiler`/`lox-vm` et suivent le format texte du §7 de la spec).

use thiserror::Error;

/// Erreurs que peut lever `lox-core` lui-même (limites structurelles du
/// format bytecode, ex: dépassement du pool de constantes).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Plus de 256 constantes dans un même chunk.
    #[error("Too many constants in one chunk.")]
    TooManyConstants,

    /// Saut (forward) dont la distance dépasse 65535 octets.
    #[error("Too much code to jump over.")]
    JumpTooLarge,

    /// Index de constante hors bornes au décodage.
    #[error("invalid constant index {0}")]
    BadConstantIndex(u32),
}

/// Alias pratique.
pub type Result<T, E = Error> = std::result::Result<T, E>;
