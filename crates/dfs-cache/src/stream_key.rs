use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use dfs_types::{PackExt, RepositoryDescription};

/// Identity of one logical byte stream held in the block cache.
///
/// A key names `(repository, file name, extension)`. The hash is computed
/// once at construction; equality is structural. Keys are cheap to clone.
#[derive(Clone)]
pub struct StreamKey {
    inner: Arc<KeyInner>,
}

#[derive(PartialEq, Eq)]
struct KeyInner {
    hash: u32,
    repository: RepositoryDescription,
    name: String,
    ext: PackExt,
}

impl StreamKey {
    /// Key for the file `name` with extension `ext` in `repository`.
    pub fn of(repository: &RepositoryDescription, name: impl Into<String>, ext: PackExt) -> Self {
        let name = name.into();
        let mut hasher = DefaultHasher::new();
        repository.hash(&mut hasher);
        name.hash(&mut hasher);
        ext.hash(&mut hasher);
        let h = hasher.finish();
        Self {
            inner: Arc::new(KeyInner {
                hash: (h ^ (h >> 32)) as u32,
                repository: repository.clone(),
                name,
                ext,
            }),
        }
    }

    /// Key of the reverse index computed from this (primary index) key.
    ///
    /// It lives in the same identity space as the index key but never
    /// compares equal to it.
    pub fn for_reverse_index(&self) -> Self {
        Self::of(
            &self.inner.repository,
            self.inner.name.clone(),
            PackExt::ReverseIndex,
        )
    }

    /// Precomputed hash code, used for slot and lock selection.
    pub fn hash_code(&self) -> u32 {
        self.inner.hash
    }

    pub fn repository(&self) -> &RepositoryDescription {
        &self.inner.repository
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ext(&self) -> PackExt {
        self.inner.ext
    }

    /// Position of the key's extension, indexing per-extension statistics.
    pub fn ext_position(&self) -> usize {
        self.inner.ext.position()
    }
}

impl PartialEq for StreamKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl Eq for StreamKey {}

impl Hash for StreamKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.inner.hash);
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamKey({}/{}:{})",
            self.inner.repository, self.inner.name, self.inner.ext
        )
    }
}
