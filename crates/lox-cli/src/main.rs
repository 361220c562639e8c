//! lox-cli/src/main.rs
//!
//! Point d'entrée du binaire `lox`. Prépare l'environnement (rapports
//! d'erreur, logs) puis délègue à `lox_cli::run()`.

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: failed to install color-eyre: {e}");
    }
    tracing_subscriber::fmt::init();

    match lox_cli::run() {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(74);
        }
    }
}
