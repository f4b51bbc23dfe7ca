//! Secrets that must not reach logs.
//!
//! [`Redacted`] holds a private key or keystore password. Its `Debug` and
//! `Display` both print `<redacted>`, so a config dumped with `{:?}` or an
//! error built with `{}` never leaks the value. Read it with [`Redacted::expose`].

use std::fmt::{self, Debug, Display};

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// The wrapped secret; keep the borrow short and never log it
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> From<T> for Redacted<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatting_hides_value() {
        let secret = Redacted::new("hunter2".to_string());
        assert_eq!(format!("{:?}", secret), "<redacted>");
        assert_eq!(format!("{}", secret), "<redacted>");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_nested_debug() {
        #[derive(Debug)]
        #[allow(dead_code)]
        struct Holder {
            key: Redacted<String>,
        }
        let holder = Holder {
            key: "0xabc".to_string().into(),
        };
        let shown = format!("{:?}", holder);
        assert!(shown.contains("<redacted>"));
        assert!(!shown.contains("0xabc"));
    }
}
