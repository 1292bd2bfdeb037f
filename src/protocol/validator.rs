//! Runtime-composed frame matchers
//!
//! A validator is a small expression tree evaluated against the raw text
//! of a frame. Kept as data (no closures) so compositions can be
//! inspected and tested.

/// Frame-shape predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validator {
    /// Frame starts with the given text
    Prefix(String),
    /// Frame ends with the given text
    Suffix(String),
    /// Frame contains the given text
    Contains(String),
    /// At least one child matches
    AnyOf(Vec<Validator>),
    /// Every child matches
    AllOf(Vec<Validator>),
}

impl Validator {
    pub fn prefix(s: impl Into<String>) -> Self {
        Validator::Prefix(s.into())
    }

    pub fn suffix(s: impl Into<String>) -> Self {
        Validator::Suffix(s.into())
    }

    pub fn contains(s: impl Into<String>) -> Self {
        Validator::Contains(s.into())
    }

    pub fn any_of(children: Vec<Validator>) -> Self {
        Validator::AnyOf(children)
    }

    pub fn all_of(children: Vec<Validator>) -> Self {
        Validator::AllOf(children)
    }

    /// Evaluate against one raw frame
    pub fn check(&self, frame: &str) -> bool {
        match self {
            Validator::Prefix(p) => frame.starts_with(p.as_str()),
            Validator::Suffix(s) => frame.ends_with(s.as_str()),
            Validator::Contains(c) => frame.contains(c.as_str()),
            Validator::AnyOf(children) => children.iter().any(|v| v.check(frame)),
            Validator::AllOf(children) => children.iter().all(|v| v.check(frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives() {
        assert!(Validator::prefix("{\"action\"").check(r#"{"action":"candles"}"#));
        assert!(Validator::suffix("}").check(r#"{"a":1}"#));
        assert!(Validator::contains("\"assetId\":142").check(r#"{"assetId":142,"tf":5}"#));
        assert!(!Validator::contains("\"assetId\":151").check(r#"{"assetId":142}"#));
    }

    #[test]
    fn test_any_of() {
        let v = Validator::any_of(vec![
            Validator::contains("optionFinished"),
            Validator::contains("closeTradeSuccessful"),
        ]);
        assert!(v.check(r#"{"action":"optionFinished"}"#));
        assert!(v.check(r#"{"action":"closeTradeSuccessful"}"#));
        assert!(!v.check(r#"{"action":"candles"}"#));
    }

    #[test]
    fn test_all_of() {
        let v = Validator::all_of(vec![
            Validator::contains("candles"),
            Validator::contains("\"assetId\":142"),
        ]);
        assert!(v.check(r#"{"action":"candles","message":{"assetId":142}}"#));
        assert!(!v.check(r#"{"action":"candles","message":{"assetId":151}}"#));
    }

    #[test]
    fn test_empty_compositions() {
        // all-of over nothing is vacuously true, any-of is false
        assert!(Validator::all_of(vec![]).check("x"));
        assert!(!Validator::any_of(vec![]).check("x"));
    }
}
