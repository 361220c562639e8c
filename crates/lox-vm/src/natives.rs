//! natives.rs — fonctions natives (host) installées dans les globales par défaut.

use std::time::{SystemTime, UNIX_EPOCH};

use lox_core::Value;

/// `clock()` : secondes écoulées depuis l'époque Unix, en flottant.
///
/// L'implémentation de référence renvoie un temps relatif au process
/// (`clock() / CLOCKS_PER_SEC`) ; ici on utilise l'horloge murale, ce qui
/// suffit à l'usage attendu (mesurer des durées par soustraction).
pub fn clock(_args: &[Value]) -> Value {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_positive_number() {
        let Value::Number(n) = clock(&[]) else { panic!("expected a number") };
        assert!(n > 0.0);
    }
}
