//! The bundled map/reduce applications, selectable by name from `mrworker`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::mr::worker::{KeyValue, MapFn, ReduceFn};

/// Word count.
pub mod wc {
    use super::*;

    static WORD: Lazy<Regex> = Lazy::new(|| Regex::new("[A-Za-z]+").unwrap());

    /// Emits `(word, "1")` for every maximal run of letters.
    pub fn map(_input: &str, contents: &str) -> Vec<KeyValue> {
        WORD.find_iter(contents)
            .map(|word| KeyValue { key: word.as_str().to_string(), value: "1".to_string() })
            .collect()
    }

    /// Every value is a "1", so the count is just how many there are.
    pub fn reduce(_key: &str, values: &[String]) -> String {
        values.len().to_string()
    }
}

/// Resolve an application name to its map/reduce pair.
pub fn lookup(name: &str) -> Option<(MapFn, ReduceFn)> {
    match name {
        "wc" => Some((wc::map, wc::reduce)),
        _ => None,
    }
}
