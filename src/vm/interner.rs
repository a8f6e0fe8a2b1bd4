// Strand Name Interner
// Module, file and function names are shared between modules, frames and traces

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::{Arc, OnceLock};

/// Process-wide set of names.
///
/// Trace capture clones names out of modules, interning keeps those clones
/// to a refcount bump.
pub struct Interner {
    names: Mutex<FxHashSet<Arc<str>>>,
}

impl Default for Interner {
    fn default() -> Self {
        Self {
            names: Mutex::new(FxHashSet::default()),
        }
    }
}

impl Interner {
    pub fn global() -> &'static Interner {
        static NAMES: OnceLock<Interner> = OnceLock::new();
        NAMES.get_or_init(Interner::default)
    }

    pub fn intern(&self, name: &str) -> Arc<str> {
        let mut names = self.names.lock();
        match names.get(name) {
            Some(shared) => shared.clone(),
            None => {
                let shared: Arc<str> = Arc::from(name);
                names.insert(shared.clone());
                shared
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn intern(name: &str) -> Arc<str> {
    Interner::global().intern(name)
}
