//! lox-cli/src/lib.rs — pilote en ligne de commande pour Lox.
//!
//! Deux modes, comme l'implémentation de référence :
//!   - `lox` (sans argument)      : REPL, une ligne compilée + exécutée à la fois,
//!                                   globales et tas partagés entre les lignes.
//!   - `lox chemin/vers/script.lox` : exécute un fichier entier.
//!
//! Codes de sortie (§7 "Driver") : `0` succès, `65` erreur de compilation,
//! `70` erreur d'exécution, `74` impossible de lire le fichier source.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use lox_core::{disassemble_chunk, Obj};
use lox_vm::{Vm, VmOptions};

/// Issue d'une exécution, convertible en code de sortie process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliOutcome {
    Ok,
    CompileError,
    RuntimeError,
}

impl CliOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            CliOutcome::Ok => 0,
            CliOutcome::CompileError => 65,
            CliOutcome::RuntimeError => 70,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "lox", version, about = "Lox bytecode compiler + virtual machine")]
struct Cli {
    /// Script à exécuter ; omis pour démarrer un REPL.
    path: Option<PathBuf>,

    /// Journalise chaque instruction exécutée.
    #[arg(long, env = "LOX_TRACE")]
    trace: bool,

    /// Force une collecte GC avant chaque allocation (diagnostic).
    #[arg(long, env = "LOX_GC_STRESS")]
    gc_stress: bool,

    /// Journalise chaque collecte GC.
    #[arg(long, env = "LOX_GC_LOG")]
    gc_log: bool,

    /// Désassemble chaque chunk compilé sur stderr avant de l'exécuter.
    #[arg(long, env = "LOX_DISASSEMBLE")]
    disassemble: bool,
}

/// Point d'entrée de la bibliothèque, appelé par `main.rs`.
pub fn run() -> Result<CliOutcome> {
    let cli = Cli::parse();
    let options = VmOptions::default().with_trace(cli.trace).with_gc_stress(cli.gc_stress).with_gc_log(cli.gc_log);

    match cli.path {
        Some(path) => run_file(&path, options, cli.disassemble),
        None => run_repl(options, cli.disassemble),
    }
}

/// Imprime sur stderr la désassemblée du chunk de plus haut niveau de
/// `handle` (les fonctions imbriquées ont leur propre chunk, non développé
/// ici).
fn print_disassembly(vm: &Vm, handle: lox_core::ObjHandle, name: &str) {
    if let Some(Obj::Function(function)) = vm.heap().get(handle) {
        eprint!("{}", disassemble_chunk(&function.chunk, vm.heap(), name));
    }
}

fn run_file(path: &Path, options: VmOptions, disassemble: bool) -> Result<CliOutcome> {
    let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut vm = Vm::with_options(options);

    match lox_compiler::compile(&source, vm.heap_mut()) {
        Ok(function) => {
            if disassemble {
                print_disassembly(&vm, function, &path.display().to_string());
            }
            match vm.interpret(function) {
                Ok(()) => Ok(CliOutcome::Ok),
                Err(err) => {
                    eprintln!("{err}");
                    Ok(CliOutcome::RuntimeError)
                }
            }
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("{error}");
            }
            Ok(CliOutcome::CompileError)
        }
    }
}

fn run_repl(options: VmOptions, disassemble: bool) -> Result<CliOutcome> {
    let mut vm = Vm::with_options(options);
    let mut line = String::new();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        line.clear();
        let bytes_read = io::stdin().read_line(&mut line).context("reading from stdin")?;
        if bytes_read == 0 {
            println!();
            break;
        }

        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        match lox_compiler::compile(trimmed, vm.heap_mut()) {
            Ok(function) => {
                if disassemble {
                    print_disassembly(&vm, function, "repl");
                }
                if let Err(err) = vm.interpret(function) {
                    eprintln!("{err}");
                }
            }
            Err(errors) => {
                for error in &errors {
                    eprintln!("{error}");
                }
            }
        }
    }

    Ok(CliOutcome::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_driver_contract() {
        assert_eq!(CliOutcome::Ok.exit_code(), 0);
        assert_eq!(CliOutcome::CompileError.exit_code(), 65);
        assert_eq!(CliOutcome::RuntimeError.exit_code(), 70);
    }

    #[test]
    fn debug_flags_parse_from_cli_args() {
        let cli = Cli::try_parse_from(["lox", "--trace", "--disassemble", "script.lox"]).unwrap();
        assert!(cli.trace);
        assert!(cli.disassemble);
        assert!(!cli.gc_stress);
        assert_eq!(cli.path.as_deref(), Some(Path::new("script.lox")));
    }
}
