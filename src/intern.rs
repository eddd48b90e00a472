// String interner - stable shared symbols for function/component names
//
// Parsers and classifiers compare function names millions of times while
// stitching a trace. Interning every recurring string once and handing out
// cheap `Arc<str>` clones keeps those comparisons allocation-free and lets
// classifier sets hash the symbol content directly.

use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

/// An interned string handle. Clones are refcount bumps; equality and
/// hashing go through the string content, so two `Sym`s from different
/// interner calls for the same text always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sym(Arc<str>);

impl Sym {
    #[allow(dead_code)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for Sym {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Sym {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl From<&str> for Sym {
    fn from(s: &str) -> Self {
        Sym(Arc::from(s))
    }
}

/// Internally synchronized intern pool. Returned `Sym`s stay valid for the
/// process lifetime; the pool only ever grows.
#[derive(Debug, Default)]
pub struct Interner {
    pool: Mutex<HashSet<Arc<str>>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning the pooled symbol for it.
    pub fn intern(&self, s: &str) -> Sym {
        let mut pool = self.pool.lock().unwrap();
        if let Some(existing) = pool.get(s) {
            return Sym(Arc::clone(existing));
        }
        let arc: Arc<str> = Arc::from(s);
        pool.insert(Arc::clone(&arc));
        Sym(arc)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_shared_storage() {
        let interner = Interner::new();
        let a = interner.intern("entry_SYSCALL_64");
        let b = interner.intern("entry_SYSCALL_64");
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_distinct_strings_distinct_symbols() {
        let interner = Interner::new();
        let a = interner.intern("i40e_lan_xmit_frame");
        let b = interner.intern("i40e_napi_poll");
        assert_ne!(a, b);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_sym_equality_is_content_based() {
        let a = Sym::from("tcp_transmit_skb");
        let interner = Interner::new();
        let b = interner.intern("tcp_transmit_skb");
        assert_eq!(a, b);
    }
}
