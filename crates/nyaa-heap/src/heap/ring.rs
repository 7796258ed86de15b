//! Page arena and intrusive page rings.
//!
//! Pages are owned by a generation-checked slot map. Rings are circular doubly
//! linked lists threaded through the arena entries by index, so unlinking a
//! page that is about to go back to the OS never leaves a dangling pointer
//! behind, and a stale [`PageId`] is rejected instead of aliasing a new page.

/// Stable handle to a page in a [`PageArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    index: u32,
    generation: u32,
}

impl PageId {
    /// Slot index of the page.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this id was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Which ring an entry is currently linked into.
pub type RingTag = u8;

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
    prev: u32,
    next: u32,
    ring: Option<RingTag>,
}

/// Generation-checked slot map of pages.
#[derive(Debug)]
pub struct PageArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for PageArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PageArena<T> {
    /// Empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the arena holds no pages.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserve the id the next [`insert`](Self::insert) will return.
    #[must_use]
    pub fn next_id(&self) -> PageId {
        match self.free.last() {
            Some(&index) => PageId {
                index,
                generation: self.entries[index as usize].generation,
            },
            None => PageId {
                #[allow(clippy::cast_possible_truncation)]
                index: self.entries.len() as u32,
                generation: 0,
            },
        }
    }

    /// Store a page and return its id.
    pub fn insert(&mut self, value: T) -> PageId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return PageId {
                index,
                generation: entry.generation,
            };
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
            prev: index,
            next: index,
            ring: None,
        });
        PageId {
            index,
            generation: 0,
        }
    }

    /// Remove a page. The page must not be linked into a ring.
    pub fn remove(&mut self, id: PageId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation || entry.value.is_none() {
            return None;
        }
        assert!(entry.ring.is_none(), "removing page {id:?} still in a ring");
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        entry.value.take()
    }

    fn entry(&self, id: PageId) -> Option<&Entry<T>> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation && e.value.is_some())
    }

    /// Returns `true` if `id` refers to a live page.
    #[must_use]
    pub fn contains(&self, id: PageId) -> bool {
        self.entry(id).is_some()
    }

    /// Shared access to a page.
    #[must_use]
    pub fn get(&self, id: PageId) -> Option<&T> {
        self.entry(id).and_then(|e| e.value.as_ref())
    }

    /// Exclusive access to a page.
    pub fn get_mut(&mut self, id: PageId) -> Option<&mut T> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.value.as_mut())
    }

    /// The ring `id` is linked into, if any.
    #[must_use]
    pub fn ring_of(&self, id: PageId) -> Option<RingTag> {
        self.entry(id).and_then(|e| e.ring)
    }

    fn id_at(&self, index: u32) -> PageId {
        PageId {
            index,
            generation: self.entries[index as usize].generation,
        }
    }
}

/// A circular ring of pages threaded through a [`PageArena`].
///
/// A page is in at most one ring at a time; the arena records which.
#[derive(Debug)]
pub struct PageRing {
    tag: RingTag,
    head: Option<u32>,
    len: usize,
}

impl PageRing {
    /// Empty ring identified by `tag`.
    #[must_use]
    pub const fn new(tag: RingTag) -> Self {
        Self {
            tag,
            head: None,
            len: 0,
        }
    }

    /// Number of pages in the ring.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty ring.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First page.
    #[must_use]
    pub fn front<T>(&self, arena: &PageArena<T>) -> Option<PageId> {
        self.head.map(|index| arena.id_at(index))
    }

    fn link<T>(&mut self, arena: &mut PageArena<T>, id: PageId, make_head: bool) {
        assert!(arena.contains(id), "linking stale page {id:?}");
        let index = id.index;
        assert!(
            arena.entries[index as usize].ring.is_none(),
            "page {id:?} already in a ring"
        );
        match self.head {
            None => {
                let entry = &mut arena.entries[index as usize];
                entry.prev = index;
                entry.next = index;
                self.head = Some(index);
            }
            Some(head) => {
                let tail = arena.entries[head as usize].prev;
                {
                    let entry = &mut arena.entries[index as usize];
                    entry.prev = tail;
                    entry.next = head;
                }
                arena.entries[tail as usize].next = index;
                arena.entries[head as usize].prev = index;
                if make_head {
                    self.head = Some(index);
                }
            }
        }
        arena.entries[index as usize].ring = Some(self.tag);
        self.len += 1;
    }

    /// Link `id` as the new first page.
    pub fn push_front<T>(&mut self, arena: &mut PageArena<T>, id: PageId) {
        self.link(arena, id, true);
    }

    /// Link `id` as the new last page.
    pub fn push_back<T>(&mut self, arena: &mut PageArena<T>, id: PageId) {
        self.link(arena, id, false);
    }

    /// Unlink `id`. Returns `false` when the page is not in this ring.
    pub fn unlink<T>(&mut self, arena: &mut PageArena<T>, id: PageId) -> bool {
        if arena.ring_of(id) != Some(self.tag) {
            return false;
        }
        let index = id.index;
        let (prev, next) = {
            let entry = &arena.entries[index as usize];
            (entry.prev, entry.next)
        };
        if self.len == 1 {
            self.head = None;
        } else {
            arena.entries[prev as usize].next = next;
            arena.entries[next as usize].prev = prev;
            if self.head == Some(index) {
                self.head = Some(next);
            }
        }
        let entry = &mut arena.entries[index as usize];
        entry.prev = index;
        entry.next = index;
        entry.ring = None;
        self.len -= 1;
        true
    }

    /// Unlink and return the first page.
    pub fn pop_front<T>(&mut self, arena: &mut PageArena<T>) -> Option<PageId> {
        let id = self.front(arena)?;
        self.unlink(arena, id);
        Some(id)
    }

    /// Move `id`, already in this ring, to the front.
    pub fn move_to_front<T>(&mut self, arena: &mut PageArena<T>, id: PageId) {
        if self.unlink(arena, id) {
            self.push_front(arena, id);
        }
    }

    /// Snapshot of the ring in order, starting at the front.
    #[must_use]
    pub fn ids<T>(&self, arena: &PageArena<T>) -> Vec<PageId> {
        let mut ids = Vec::with_capacity(self.len);
        let Some(mut index) = self.head else {
            return ids;
        };
        for _ in 0..self.len {
            ids.push(arena.id_at(index));
            index = arena.entries[index as usize].next;
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_generation_check() {
        let mut arena = PageArena::new();
        let a = arena.insert("a");
        assert_eq!(arena.get(a), Some(&"a"));

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);

        let b = arena.insert("b");
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn test_next_id_matches_insert() {
        let mut arena = PageArena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let predicted = arena.next_id();
        assert_eq!(arena.insert(2), predicted);
        let predicted = arena.next_id();
        assert_eq!(arena.insert(3), predicted);
    }

    #[test]
    fn test_ring_order() {
        let mut arena = PageArena::new();
        let mut ring = PageRing::new(0);
        let ids: Vec<_> = (0..4).map(|i| arena.insert(i)).collect();

        ring.push_back(&mut arena, ids[1]);
        ring.push_back(&mut arena, ids[2]);
        ring.push_front(&mut arena, ids[0]);
        ring.push_back(&mut arena, ids[3]);
        assert_eq!(ring.ids(&arena), ids);

        assert!(ring.unlink(&mut arena, ids[2]));
        assert_eq!(ring.ids(&arena), vec![ids[0], ids[1], ids[3]]);

        ring.move_to_front(&mut arena, ids[3]);
        assert_eq!(ring.ids(&arena), vec![ids[3], ids[0], ids[1]]);

        assert_eq!(ring.pop_front(&mut arena), Some(ids[3]));
        assert_eq!(ring.pop_front(&mut arena), Some(ids[0]));
        assert_eq!(ring.pop_front(&mut arena), Some(ids[1]));
        assert_eq!(ring.pop_front(&mut arena), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_page_in_one_ring() {
        let mut arena = PageArena::new();
        let mut live = PageRing::new(0);
        let mut free = PageRing::new(1);
        let id = arena.insert(());

        live.push_front(&mut arena, id);
        assert_eq!(arena.ring_of(id), Some(0));
        assert!(!free.unlink(&mut arena, id));

        live.unlink(&mut arena, id);
        free.push_front(&mut arena, id);
        assert_eq!(arena.ring_of(id), Some(1));
        assert_eq!(live.len(), 0);
        assert_eq!(free.len(), 1);
    }

    #[test]
    #[should_panic(expected = "still in a ring")]
    fn test_remove_linked_panics() {
        let mut arena = PageArena::new();
        let mut ring = PageRing::new(0);
        let id = arena.insert(());
        ring.push_front(&mut arena, id);
        let _ = arena.remove(id);
    }
}
