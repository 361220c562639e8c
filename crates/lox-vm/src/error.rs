//! error.rs — erreurs d'exécution, avec la pile d'appels au moment du crash.
//!
//! Le format d'affichage suit celui de l'implémentation de référence :
//! le message d'abord, puis une ligne `[line N] in <fonction>` par frame
//! active, de la plus interne à la plus externe (`in script` pour le
//! script de plus haut niveau).

use std::fmt;

/// Une frame d'appel, telle que capturée pour une trace d'erreur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub function_name: String,
}

/// Erreur levée pendant l'exécution d'un programme compilé.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    /// De la frame la plus récente (où l'erreur a eu lieu) à la plus ancienne.
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self { message: message.into(), trace }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.trace.iter().enumerate() {
            if i + 1 == self.trace.len() {
                write!(f, "[line {}] in {}", frame.line, frame.function_name)?;
            } else {
                writeln!(f, "[line {}] in {}", frame.line, frame.function_name)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_message_then_trace_innermost_first() {
        let err = RuntimeError::new(
            "Undefined property 'x'.",
            vec![
                TraceFrame { line: 4, function_name: "inner".to_string() },
                TraceFrame { line: 9, function_name: "script".to_string() },
            ],
        );
        assert_eq!(
            err.to_string(),
            "Undefined property 'x'.\n[line 4] in inner\n[line 9] in script"
        );
    }
}
