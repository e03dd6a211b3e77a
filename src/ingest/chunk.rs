//! Chunk ring - fixed-capacity record buffers for the ingest hot path
//!
//! A [`Chunk`] holds up to `cap` log entries. Chunks form a singly linked
//! ring traversed by two cursors: the write head (target of [`Chunk::put`])
//! and the flush head (owned by the ingester's maintenance loop).
//!
//! Writers reserve a slot by incrementing `book`, publish the entry into the
//! slot, and then increment `write`. Readers sample `write` with acquire
//! ordering and may only look at slots `[0, write)`. A reservation that
//! lands past the capacity is never rolled back; the writer simply forwards
//! the entry to the successor chunk. Rolling `book` back would race with
//! concurrent reservations.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Hard upper bound on the number of slots per chunk.
pub const MAX_CHUNK_CAP: u32 = 900;

/// An immutable log record: instant, severity and opaque encoded payload.
///
/// Severity bands: `< 0` debug, `0..=3` info, `4..=7` warn, `>= 8` error.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub time: DateTime<Utc>,
    pub level: i8,
    pub content: Vec<u8>,
}

impl Entry {
    pub fn new(time: DateTime<Utc>, level: i8, content: Vec<u8>) -> Self {
        Self {
            time,
            level,
            content,
        }
    }
}

/// A bounded, append-only buffer of log entries.
pub struct Chunk {
    /// Stable identifier, monotonic within a ring.
    id: i32,
    /// Number of slots.
    cap: u32,
    /// Reservations taken. May exceed `cap`; overflow reservations are
    /// tombstones and never counted by `write`.
    book: AtomicU32,
    /// Completed (published) writes. Always `<= min(book, cap)`.
    write: AtomicU32,
    /// Total content bytes published into this chunk.
    size: AtomicU64,
    /// Smallest entry epoch (seconds) seen, `i64::MAX` while empty.
    epoch_start: AtomicI64,
    /// Largest entry epoch (seconds) seen, `i64::MIN` while empty.
    epoch_end: AtomicI64,
    /// Failed flush attempts.
    retries: AtomicU32,
    /// Once set, no new reservation on this chunk may succeed.
    locked: AtomicBool,
    next: OnceLock<Arc<Chunk>>,
    entries: Box<[OnceLock<Entry>]>,
}

impl Chunk {
    pub fn new(id: i32, cap: u32) -> Self {
        let cap = cap.clamp(1, MAX_CHUNK_CAP);
        Self {
            id,
            cap,
            book: AtomicU32::new(0),
            write: AtomicU32::new(0),
            size: AtomicU64::new(0),
            epoch_start: AtomicI64::new(i64::MAX),
            epoch_end: AtomicI64::new(i64::MIN),
            retries: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            next: OnceLock::new(),
            entries: (0..cap).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Pre-materializes up to `depth` successors so the hot path does not
    /// allocate.
    pub fn init(self: &Arc<Self>, depth: u32) {
        if depth == 0 {
            return;
        }
        let next = self.next_or_init();
        if depth > 1 {
            next.init(depth - 1);
        }
    }

    /// Successor chunk, creating it if needed. Concurrent overflowing
    /// writers race to create-or-observe a single successor.
    pub fn next_or_init(self: &Arc<Self>) -> Arc<Chunk> {
        Arc::clone(
            self.next
                .get_or_init(|| Arc::new(Chunk::new(self.id + 1, self.cap))),
        )
    }

    pub fn next(&self) -> Option<Arc<Chunk>> {
        self.next.get().cloned()
    }

    /// Tries to reserve a slot for `entry` in this chunk, forwarding to the
    /// successor when locked or at capacity. Returns the chunk that accepted
    /// the entry and whether it was some chunk other than `self`.
    pub fn put(self: &Arc<Self>, entry: Entry) -> (Arc<Chunk>, bool) {
        if self.locked.load(Ordering::Acquire) {
            let (into, _) = self.next_or_init().put(entry);
            return (into, true);
        }

        let index = self.book.fetch_add(1, Ordering::AcqRel);
        if index >= self.cap {
            // Full. The reservation stays as a tombstone.
            let (into, _) = self.next_or_init().put(entry);
            return (into, true);
        }

        let epoch = entry.time.timestamp();
        let bytes = entry.content.len() as u64;

        // Publish the slot before the write counter; readers that observe
        // the incremented counter see the entry.
        let _ = self.entries[index as usize].set(entry);

        self.epoch_start.fetch_min(epoch, Ordering::AcqRel);
        self.epoch_end.fetch_max(epoch, Ordering::AcqRel);
        self.size.fetch_add(bytes, Ordering::AcqRel);
        self.write.fetch_add(1, Ordering::Release);

        (Arc::clone(self), false)
    }

    /// No reservation was ever attempted.
    pub fn is_empty(&self) -> bool {
        self.book.load(Ordering::Acquire) == 0
    }

    /// All reserved slots are published and no further writes can land here:
    /// either the chunk filled up or it was locked and drained.
    pub fn is_ready(&self) -> bool {
        let write = self.write.load(Ordering::Acquire);
        if write == self.cap {
            return true;
        }
        let book = self.book.load(Ordering::Acquire);
        book > 0 && write == book && self.locked.load(Ordering::Acquire)
    }

    /// Blocks new reservations. Writes already booked may still publish.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Age of the most recently published entry, zero when nothing is
    /// visible yet.
    pub fn ttl(&self) -> Duration {
        let write = self.write.load(Ordering::Acquire);
        if write == 0 {
            return Duration::zero();
        }
        match self.entries[(write - 1) as usize].get() {
            Some(e) => Utc::now() - e.time,
            None => Duration::zero(),
        }
    }

    /// Published entries, in slot order. Slots whose writer has not finished
    /// publishing yet are skipped.
    pub fn list(&self) -> Vec<&Entry> {
        let write = self.write.load(Ordering::Acquire) as usize;
        (0..write)
            .filter_map(|i| self.entries[i].get())
            .collect()
    }

    /// Smallest epoch (seconds) over published entries.
    pub fn first_epoch(&self) -> Option<i64> {
        let v = self.epoch_start.load(Ordering::Acquire);
        (v != i64::MAX).then_some(v)
    }

    /// Largest epoch (seconds) over published entries.
    pub fn last_epoch(&self) -> Option<i64> {
        let v = self.epoch_end.load(Ordering::Acquire);
        (v != i64::MIN).then_some(v)
    }

    /// Content bytes published so far.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Number of non-empty chunks reachable from this one, this one
    /// included. An empty chunk terminates the walk.
    pub fn depth(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        let mut depth = 1;
        let mut current = self.next();
        while let Some(c) = current {
            if c.is_empty() {
                break;
            }
            depth += 1;
            current = c.next();
        }
        depth
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// Records a failed flush attempt, returning the new count.
    pub fn fail(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("cap", &self.cap)
            .field("book", &self.book.load(Ordering::Relaxed))
            .field("write", &self.write.load(Ordering::Relaxed))
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(time: DateTime<Utc>) -> Entry {
        Entry::new(time, 0, b"{\"msg\":\"test\"}".to_vec())
    }

    fn entry_now() -> Entry {
        entry_at(Utc::now())
    }

    #[test]
    fn test_init_materializes_successors() {
        let chunk = Arc::new(Chunk::new(0, 4));
        chunk.init(2);

        let next = chunk.next().expect("next chunk should be initialized");
        assert_eq!(next.id(), 1);
        assert!(next.next().is_some());
        assert!(next.next().unwrap().next().is_none());
    }

    #[test]
    fn test_put_accepts_until_full() {
        let chunk = Arc::new(Chunk::new(0, 1));

        let (into, forwarded) = chunk.put(entry_now());
        assert_eq!(into.id(), chunk.id());
        assert!(!forwarded);

        // Second put overflows into the successor.
        let (into, forwarded) = chunk.put(entry_now());
        assert_eq!(into.id(), 1);
        assert!(forwarded);
    }

    #[test]
    fn test_lock_forwards_to_next() {
        let chunk = Arc::new(Chunk::new(0, 2));
        chunk.lock();
        assert!(chunk.is_locked());

        let e = entry_now();
        let (into, forwarded) = chunk.put(e.clone());
        assert!(forwarded);
        assert_eq!(into.id(), chunk.next().unwrap().id());
        assert_eq!(chunk.next().unwrap().list(), vec![&e]);
    }

    #[test]
    fn test_empty_and_ready() {
        let chunk = Arc::new(Chunk::new(0, 2));
        assert!(chunk.is_empty());
        assert!(!chunk.is_ready());

        chunk.put(entry_now());
        assert!(!chunk.is_empty());
        assert!(!chunk.is_ready());

        chunk.put(entry_now());
        assert!(chunk.is_ready(), "chunk at capacity should be ready");
    }

    #[test]
    fn test_locked_partial_chunk_becomes_ready() {
        let chunk = Arc::new(Chunk::new(0, 4));
        chunk.put(entry_now());
        assert!(!chunk.is_ready());

        chunk.lock();
        assert!(chunk.is_ready(), "locked chunk with all writes published should be ready");
    }

    #[test]
    fn test_epoch_bounds() {
        let chunk = Arc::new(Chunk::new(0, 4));
        assert_eq!(chunk.first_epoch(), None);
        assert_eq!(chunk.last_epoch(), None);

        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        chunk.put(entry_at(t1));
        chunk.put(entry_at(t0));

        assert_eq!(chunk.first_epoch(), Some(t0.timestamp()));
        assert_eq!(chunk.last_epoch(), Some(t1.timestamp()));
    }

    #[test]
    fn test_ttl() {
        let chunk = Arc::new(Chunk::new(0, 4));
        assert_eq!(chunk.ttl(), Duration::zero());

        chunk.put(entry_at(Utc::now() - Duration::seconds(10)));
        assert!(chunk.ttl() >= Duration::seconds(10));
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let chunk = Arc::new(Chunk::new(0, 4));
        assert!(chunk.list().is_empty());

        let base = Utc::now();
        for i in 0..4 {
            chunk.put(entry_at(base + Duration::seconds(i)));
        }

        let list = chunk.list();
        assert_eq!(list.len(), 4);
        for (i, e) in list.iter().enumerate() {
            assert_eq!(e.time, base + Duration::seconds(i as i64));
        }
    }

    #[test]
    fn test_size_tracks_content_bytes() {
        let chunk = Arc::new(Chunk::new(0, 4));
        chunk.put(Entry::new(Utc::now(), 0, vec![0u8; 7]));
        chunk.put(Entry::new(Utc::now(), 0, vec![0u8; 3]));
        assert_eq!(chunk.size(), 10);
    }

    #[test]
    fn test_depth() {
        let chunk = Arc::new(Chunk::new(0, 1));
        assert_eq!(chunk.depth(), 0, "empty chunk should have depth 0");

        chunk.put(entry_now());
        assert_eq!(chunk.depth(), 1);

        // Overflow fills the successor too.
        chunk.put(entry_now());
        assert_eq!(chunk.depth(), 2);
    }

    #[test]
    fn test_concurrent_put_loses_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        const CAP: u32 = 64;

        let root = Arc::new(Chunk::new(0, CAP));
        root.init(4);

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let chunk = Arc::clone(&root);
                std::thread::spawn(move || {
                    let mut current = chunk;
                    for i in 0..PER_THREAD {
                        let content = format!("{{\"t\":{},\"i\":{}}}", t, i).into_bytes();
                        let (into, forwarded) =
                            current.put(Entry::new(Utc::now(), 0, content));
                        if forwarded {
                            current = into;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut total = 0usize;
        let mut seen = std::collections::HashSet::new();
        let mut current = Some(root);
        while let Some(c) = current {
            let list = c.list();
            assert!(list.len() <= CAP as usize);
            for e in &list {
                assert!(e.time.timestamp() >= 0);
                assert!(
                    seen.insert(e.content.clone()),
                    "entry duplicated across the ring"
                );
            }
            total += list.len();
            current = c.next();
        }
        assert_eq!(total, THREADS * PER_THREAD);
    }
}
