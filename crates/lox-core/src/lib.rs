//! lox-core — modèle de valeurs, format bytecode et tas GC pour Lox.
//!
//! Contient tout ce qu'il faut pour représenter et faire vivre un programme
//! Lox compilé, sans dépendre du compilateur ni de la VM :
//!
//! - `value`  : `Value`, union taguée (nil/bool/number/objet).
//! - `object` : variantes d'objets tas (String/Function/Native/Closure/
//!   Upvalue/Class/Instance/BoundMethod) et leurs handles stables.
//! - `chunk`  : `Chunk` (code, pool de constantes, table de lignes).
//! - `ops`    : jeu d'opcodes `Op` émis par le compilateur, lu par la VM.
//! - `heap`   : tas à arène (`Heap`), table d'internement des chaînes, et
//!   le collecteur mark-and-sweep tri-color.
//! - `disasm` : désassembleur texte d'une `Chunk` (debug flag (a)).
//!
//! Le tas est un *arène* indexée (`ObjHandle` = index stable), pas un
//! graphe de pointeurs bruts : ça permet un mark-sweep sûr (pas d'`unsafe`)
//! même en présence de cycles (closures ↔ upvalues).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod chunk;
pub mod disasm;
pub mod error;
pub mod heap;
pub mod object;
pub mod ops;
pub mod value;

pub use chunk::Chunk;
pub use disasm::{disassemble_chunk, disassemble_instruction};
pub use error::Error;
pub use heap::{GcRoots, Heap, HeapStats};
pub use object::{Class, Closure, Function, Instance, Obj, ObjHandle, Upvalue};
pub use ops::Op;
pub use value::Value;

/// Prélude pratique pour les crates consommatrices (`lox-compiler`, `lox-vm`).
pub mod prelude {
    pub use crate::{
        chunk::Chunk,
        disasm::{disassemble_chunk, disassemble_instruction},
        error::Error,
        heap::{GcRoots, Heap},
        object::{Class, Closure, Function, Instance, Obj, ObjHandle, Upvalue},
        ops::Op,
        value::Value,
    };
}
