use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// File extensions that make up a pack on DFS storage.
///
/// Each extension has a fixed position used to index per-extension arrays
/// (file sizes, block sizes, cache statistics).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PackExt {
    /// The pack data file.
    Pack,
    /// Object id → offset index.
    Index,
    /// Reachability bitmaps.
    BitmapIndex,
    /// A reftable holding references.
    Reftable,
    /// Offset → object id index, derived from the primary index.
    ReverseIndex,
}

impl PackExt {
    /// Every extension, in position order.
    pub const ALL: [PackExt; 5] = [
        PackExt::Pack,
        PackExt::Index,
        PackExt::BitmapIndex,
        PackExt::Reftable,
        PackExt::ReverseIndex,
    ];

    /// Number of known extensions.
    pub const COUNT: usize = Self::ALL.len();

    /// File name suffix, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pack => "pack",
            Self::Index => "idx",
            Self::BitmapIndex => "bitmap",
            Self::Reftable => "ref",
            Self::ReverseIndex => "rev",
        }
    }

    /// Stable array position of this extension.
    pub fn position(&self) -> usize {
        match self {
            Self::Pack => 0,
            Self::Index => 1,
            Self::BitmapIndex => 2,
            Self::Reftable => 3,
            Self::ReverseIndex => 4,
        }
    }

    /// Bit of this extension in a [`PackDescription`] extension set.
    pub fn bit(&self) -> u32 {
        1 << self.position()
    }

    /// Extension at `position`, if any.
    pub fn from_position(position: usize) -> Option<Self> {
        Self::ALL.get(position).copied()
    }

    /// Parse a file name suffix.
    pub fn from_extension(ext: &str) -> Result<Self, TypeError> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.extension() == ext)
            .ok_or_else(|| TypeError::UnknownExtension(ext.to_string()))
    }

    /// Parsed index structures (as opposed to raw data files).
    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index | Self::ReverseIndex | Self::BitmapIndex)
    }
}

impl fmt::Display for PackExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// How a pack came into existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackSource {
    /// Created by an object inserter.
    Insert,
    /// Received over the network.
    Receive,
    /// Produced by compacting small packs.
    Compact,
    /// Produced by garbage collection (reachable from refs).
    Gc,
    /// Garbage collection output for objects not reachable from heads/tags.
    GcRest,
    /// Objects found unreachable by garbage collection.
    UnreachableGarbage,
}

impl PackSource {
    /// Default lookup priority category; lower sorts first.
    ///
    /// Inserted and received packs share a category.
    pub fn category(&self) -> u8 {
        match self {
            Self::Insert | Self::Receive => 0,
            Self::Compact => 1,
            Self::Gc => 2,
            Self::GcRest => 3,
            Self::UnreachableGarbage => 4,
        }
    }

    /// True for sources written by garbage collection.
    pub fn is_gc(&self) -> bool {
        matches!(self, Self::Gc | Self::GcRest | Self::UnreachableGarbage)
    }

    /// Short name used in generated pack names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Receive => "RECEIVE",
            Self::Compact => "COMPACT",
            Self::Gc => "GC",
            Self::GcRest => "GC_REST",
            Self::UnreachableGarbage => "UNREACHABLE_GARBAGE",
        }
    }
}

impl fmt::Display for PackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a repository hosted on DFS storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryDescription {
    pub name: String,
}

impl RepositoryDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for RepositoryDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Metadata about one pack (or reftable) stored on DFS.
///
/// Identity is `(repository, pack_name)`; every other field is descriptive
/// and may be filled in as the pack is written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackDescription {
    pub repository: RepositoryDescription,
    pub pack_name: String,
    pub source: PackSource,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
    pub object_count: u64,
    pub delta_count: u64,
    /// Smallest reftable update index covered (reftables only).
    pub min_update_index: u64,
    /// Largest reftable update index covered (reftables only).
    pub max_update_index: u64,
    /// Pack index format version, 0 if unknown.
    pub index_version: u32,
    file_sizes: [u64; PackExt::COUNT],
    block_sizes: [u32; PackExt::COUNT],
    extensions: u32,
}

impl PackDescription {
    /// Describe a new pack with no files yet.
    pub fn new(
        repository: RepositoryDescription,
        pack_name: impl Into<String>,
        source: PackSource,
    ) -> Self {
        Self {
            repository,
            pack_name: pack_name.into(),
            source,
            last_modified: 0,
            object_count: 0,
            delta_count: 0,
            min_update_index: 0,
            max_update_index: 0,
            index_version: 0,
            file_sizes: [0; PackExt::COUNT],
            block_sizes: [0; PackExt::COUNT],
            extensions: 0,
        }
    }

    /// Name of the file holding `ext`, e.g. `pack-1234-INSERT.idx`.
    pub fn file_name(&self, ext: PackExt) -> String {
        format!("{}.{}", self.pack_name, ext.extension())
    }

    /// True if the pack has a file with this extension.
    pub fn has_file_ext(&self, ext: PackExt) -> bool {
        self.extensions & ext.bit() != 0
    }

    /// Record that the pack has a file with this extension.
    pub fn add_file_ext(&mut self, ext: PackExt) -> &mut Self {
        self.extensions |= ext.bit();
        self
    }

    /// Size of the file for `ext`, or 0 if unknown.
    pub fn file_size(&self, ext: PackExt) -> u64 {
        self.file_sizes[ext.position()]
    }

    pub fn set_file_size(&mut self, ext: PackExt, bytes: u64) -> &mut Self {
        self.file_sizes[ext.position()] = bytes;
        self
    }

    /// Preferred block size of the file for `ext`, or 0 if unknown.
    pub fn block_size(&self, ext: PackExt) -> u32 {
        self.block_sizes[ext.position()]
    }

    pub fn set_block_size(&mut self, ext: PackExt, size: u32) -> &mut Self {
        self.block_sizes[ext.position()] = size;
        self
    }

    /// Extensions present, in position order.
    pub fn extensions(&self) -> impl Iterator<Item = PackExt> + '_ {
        PackExt::ALL.into_iter().filter(|e| self.has_file_ext(*e))
    }

    /// True if this pack only holds unreachable garbage.
    pub fn is_garbage(&self) -> bool {
        self.source == PackSource::UnreachableGarbage
    }

    /// Default object lookup priority.
    ///
    /// Non-GC sources sort first by category. Among GC packs of the same
    /// source the smaller pack file wins (better delta compression), then
    /// newer packs sort before older ones, and finally the pack with fewer
    /// objects sorts first.
    pub fn object_lookup_order(a: &Self, b: &Self) -> Ordering {
        a.source
            .category()
            .cmp(&b.source.category())
            .then_with(|| {
                if a.source == b.source && a.source.is_gc() {
                    a.file_size(PackExt::Pack).cmp(&b.file_size(PackExt::Pack))
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| b.last_modified.cmp(&a.last_modified))
            .then_with(|| a.object_count.cmp(&b.object_count))
    }

    /// Order in which reftables are stacked.
    ///
    /// GC and compacted tables come first (reverse of the lookup category),
    /// then ascending update index, then ascending modification time.
    pub fn reftable_order(a: &Self, b: &Self) -> Ordering {
        b.source
            .category()
            .cmp(&a.source.category())
            .then_with(|| a.max_update_index.cmp(&b.max_update_index))
            .then_with(|| a.last_modified.cmp(&b.last_modified))
    }
}

impl PartialEq for PackDescription {
    fn eq(&self, other: &Self) -> bool {
        self.repository == other.repository && self.pack_name == other.pack_name
    }
}

impl Eq for PackDescription {}

impl Hash for PackDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.repository.hash(state);
        self.pack_name.hash(state);
    }
}

impl fmt::Display for PackDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pack_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, source: PackSource) -> PackDescription {
        PackDescription::new(RepositoryDescription::new("repo"), name, source)
    }

    #[test]
    fn extension_positions_are_dense() {
        for (i, ext) in PackExt::ALL.iter().enumerate() {
            assert_eq!(ext.position(), i);
            assert_eq!(PackExt::from_position(i), Some(*ext));
            assert_eq!(PackExt::from_extension(ext.extension()).unwrap(), *ext);
        }
        assert!(PackExt::from_extension("keep").is_err());
    }

    #[test]
    fn file_ext_bits() {
        let mut d = desc("pack-1", PackSource::Insert);
        assert!(!d.has_file_ext(PackExt::Pack));
        d.add_file_ext(PackExt::Pack).add_file_ext(PackExt::Index);
        assert!(d.has_file_ext(PackExt::Pack));
        assert!(d.has_file_ext(PackExt::Index));
        assert!(!d.has_file_ext(PackExt::BitmapIndex));
        assert_eq!(
            d.extensions().collect::<Vec<_>>(),
            vec![PackExt::Pack, PackExt::Index]
        );
        assert_eq!(d.file_name(PackExt::Index), "pack-1.idx");
    }

    #[test]
    fn identity_ignores_metadata() {
        let mut a = desc("pack-1", PackSource::Insert);
        let b = desc("pack-1", PackSource::Gc);
        a.object_count = 99;
        assert_eq!(a, b);
        assert_ne!(a, desc("pack-2", PackSource::Insert));
    }

    #[test]
    fn lookup_order_prefers_non_gc_sources() {
        let insert = desc("a", PackSource::Insert);
        let compact = desc("b", PackSource::Compact);
        let gc = desc("c", PackSource::Gc);
        let garbage = desc("d", PackSource::UnreachableGarbage);
        let mut packs = vec![
            garbage.clone(),
            gc.clone(),
            compact.clone(),
            insert.clone(),
        ];
        packs.sort_by(PackDescription::object_lookup_order);
        assert_eq!(packs, vec![insert, compact, gc, garbage]);
    }

    #[test]
    fn lookup_order_tie_breaks() {
        let mut small_gc = desc("small", PackSource::Gc);
        small_gc.set_file_size(PackExt::Pack, 10);
        small_gc.last_modified = 1;
        let mut big_gc = desc("big", PackSource::Gc);
        big_gc.set_file_size(PackExt::Pack, 1000);
        big_gc.last_modified = 2;
        assert_eq!(
            PackDescription::object_lookup_order(&small_gc, &big_gc),
            Ordering::Less
        );

        let mut old = desc("old", PackSource::Insert);
        old.last_modified = 1;
        let mut new = desc("new", PackSource::Receive);
        new.last_modified = 2;
        assert_eq!(
            PackDescription::object_lookup_order(&new, &old),
            Ordering::Less
        );

        let mut few = desc("few", PackSource::Insert);
        few.object_count = 1;
        let mut many = desc("many", PackSource::Insert);
        many.object_count = 100;
        assert_eq!(
            PackDescription::object_lookup_order(&few, &many),
            Ordering::Less
        );
    }

    #[test]
    fn reftable_order_stacks_gc_first() {
        let gc = desc("gc", PackSource::Gc);
        let mut insert_1 = desc("i1", PackSource::Insert);
        insert_1.max_update_index = 1;
        let mut insert_2 = desc("i2", PackSource::Insert);
        insert_2.max_update_index = 2;
        let mut tables = vec![insert_2.clone(), insert_1.clone(), gc.clone()];
        tables.sort_by(PackDescription::reftable_order);
        assert_eq!(tables, vec![gc, insert_1, insert_2]);
    }

    #[test]
    fn description_serde_roundtrip() {
        let mut d = desc("pack-9", PackSource::Compact);
        d.add_file_ext(PackExt::Pack)
            .set_file_size(PackExt::Pack, 4096)
            .set_block_size(PackExt::Pack, 512);
        let json = serde_json::to_string(&d).unwrap();
        let back: PackDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.file_size(PackExt::Pack), 4096);
        assert_eq!(back.block_size(PackExt::Pack), 512);
        assert!(back.has_file_ext(PackExt::Pack));
    }
}
