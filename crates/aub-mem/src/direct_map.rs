/// Which translation a direct-map entry answers lookups for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapSpace {
    Ggtt,
    Ppgtt,
}

/// A contiguous buffer that shadows the page tables for `[address, address + data.len())`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMapEntry {
    pub address: u64,
    pub data: Vec<u8>,
    pub space: MapSpace,
    /// Reconstructed views are ephemeral and get swept by [`DirectMap::clear_ephemeral`];
    /// caller-supplied payload lives as long as the owning address space.
    pub ephemeral: bool,
}

impl DirectMapEntry {
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.data.len() as u64
    }
}

/// Insertion-ordered overlay. Lookups prefer the most recently inserted entry.
#[derive(Debug, Default)]
pub struct DirectMap {
    entries: Vec<DirectMapEntry>,
}

impl DirectMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry and return its index.
    pub fn insert(&mut self, entry: DirectMapEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&DirectMapEntry> {
        self.entries.get(index)
    }

    pub fn find(&self, space: MapSpace, address: u64) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|e| e.space == space && e.contains(address))
    }

    /// Drop every ephemeral entry, returning how many were released.
    pub fn clear_ephemeral(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.ephemeral);
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectMapEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u64, len: usize, fill: u8, ephemeral: bool) -> DirectMapEntry {
        DirectMapEntry {
            address,
            data: vec![fill; len],
            space: MapSpace::Ggtt,
            ephemeral,
        }
    }

    #[test]
    fn newest_overlapping_entry_wins() {
        let mut map = DirectMap::new();
        map.insert(entry(0x1000, 0x2000, 1, false));
        let newer = map.insert(entry(0x2000, 0x1000, 2, true));

        assert_eq!(map.find(MapSpace::Ggtt, 0x2800), Some(newer));
        assert_eq!(map.find(MapSpace::Ggtt, 0x1800), Some(0));
        assert_eq!(map.find(MapSpace::Ggtt, 0x3000), None);
        assert_eq!(map.find(MapSpace::Ppgtt, 0x1800), None);
    }

    #[test]
    fn sweep_keeps_persistent_entries() {
        let mut map = DirectMap::new();
        map.insert(entry(0x1000, 0x1000, 1, true));
        map.insert(entry(0x8000, 0x1000, 2, false));
        map.insert(entry(0x9000, 0x1000, 3, true));

        assert_eq!(map.clear_ephemeral(), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().next().map(|e| e.address), Some(0x8000));
    }
}
