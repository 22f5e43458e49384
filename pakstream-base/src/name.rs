use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Logical name of a package. Stores a precomputed hash alongside the text so
/// name comparisons in the loader's hot lookup paths are cheap and the text is
/// still available for file-path resolution and log output.
#[derive(Clone)]
pub struct PackageName {
    text: Arc<str>,
    hash: u64,
}

impl PackageName {
    pub fn new(text: &str) -> Self {
        let mut hasher = ahash::AHasher::default();
        text.hash(&mut hasher);
        PackageName {
            text: Arc::from(text),
            hash: hasher.finish(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for PackageName {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.hash == other.hash && self.text == other.text
    }
}

impl Eq for PackageName {}

impl Hash for PackageName {
    fn hash<H: Hasher>(
        &self,
        state: &mut H,
    ) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for PackageName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("PackageName").field(&self.text).finish()
    }
}

impl fmt::Display for PackageName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<&str> for PackageName {
    fn from(text: &str) -> Self {
        PackageName::new(text)
    }
}
