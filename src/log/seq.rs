//! Sequence numbers and the cluster-wide sequencer.
//!
//! A `SeqNum` is a position in one object's shared log. The `Sequencer` is
//! the only source of global ordering: it allocates strictly increasing
//! positions on top of the cluster's atomic counter primitive.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::AtomicCounter;

/// Raw value reserved for [`SeqNum::INITIAL`].
pub const INITIAL_VALUE: u64 = 0;

/// Position in a per-object shared log.
///
/// Totally ordered. `INITIAL` (zero) is reserved: it means "no entries
/// applied yet" and never has a log entry of its own.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNum(u64);

impl SeqNum {
    /// Special sequence number which will never have a log entry.
    pub const INITIAL: SeqNum = SeqNum(INITIAL_VALUE);

    /// Wraps a raw counter value. Zero maps to `INITIAL`.
    pub fn of(raw: u64) -> SeqNum {
        SeqNum(raw)
    }

    /// The raw value.
    pub fn value(self) -> u64 {
        self.0
    }

    /// True if this is the reserved initial position.
    pub fn is_initial(self) -> bool {
        self.0 == INITIAL_VALUE
    }

    /// The next position in sequence.
    ///
    /// This is plain arithmetic, not an allocation; only the
    /// [`Sequencer`] hands out positions that may be written to.
    pub fn next(self) -> SeqNum {
        SeqNum(self.0 + 1)
    }

    /// The previous position in sequence.
    ///
    /// # Panics
    ///
    /// Panics on `INITIAL`: there is no position before the start of the
    /// log.
    pub fn prev(self) -> SeqNum {
        assert!(!self.is_initial(), "INITIAL has no predecessor");
        SeqNum(self.0 - 1)
    }

    /// Steps forward (positive delta) or backward (negative delta).
    ///
    /// # Panics
    ///
    /// Panics if the step would move before `INITIAL`.
    pub fn step(self, delta: i64) -> SeqNum {
        if delta >= 0 {
            SeqNum(self.0 + delta as u64)
        } else {
            let back = delta.unsigned_abs();
            assert!(back <= self.0, "step before INITIAL");
            SeqNum(self.0 - back)
        }
    }

    /// Signed gap `other - self`, saturating at the i64 range.
    pub fn distance(self, other: SeqNum) -> i64 {
        if other.0 >= self.0 {
            i64::try_from(other.0 - self.0).unwrap_or(i64::MAX)
        } else {
            i64::try_from(self.0 - other.0)
                .map(|d| -d)
                .unwrap_or(i64::MIN)
        }
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNum({})", self.0)
    }
}

/// Allocates strictly increasing sequence numbers for one object.
///
/// Backed by the cluster-wide atomic counter, so allocation is safe under
/// unbounded concurrent callers across the cluster: no two callers ever
/// receive the same value from [`Sequencer::next`].
pub struct Sequencer {
    counter: Arc<dyn AtomicCounter>,
}

impl Sequencer {
    pub fn new(counter: Arc<dyn AtomicCounter>) -> Sequencer {
        Sequencer { counter }
    }

    /// The last issued sequence number, without allocating.
    ///
    /// `INITIAL` if nothing has been allocated yet.
    pub fn get(&self) -> SeqNum {
        SeqNum::of(self.counter.get())
    }

    /// Atomically allocates and returns a new, strictly greater sequence
    /// number, skipping the reserved `INITIAL` value if the counter ever
    /// wraps onto it.
    pub fn next(&self) -> SeqNum {
        loop {
            let allocated = SeqNum::of(self.counter.increment());
            if !allocated.is_initial() {
                return allocated;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCounter;

    #[test]
    fn test_next_prev() {
        let one = SeqNum::INITIAL.next();
        assert_eq!(1, one.value());

        let two = one.next();
        assert_eq!(2, two.value());
        assert_eq!(one, two.prev());
        assert_eq!(SeqNum::INITIAL, one.prev());
    }

    #[test]
    #[should_panic(expected = "no predecessor")]
    fn test_prev_of_initial_panics() {
        let _ = SeqNum::INITIAL.prev();
    }

    #[test]
    fn test_ordering() {
        let zero = SeqNum::INITIAL;
        let one = SeqNum::of(1);
        let two = SeqNum::of(2);

        assert!(zero < one);
        assert!(one < two);
        assert_eq!(one, zero.next());
        assert!(SeqNum::of(u64::MAX) > two);
    }

    #[test]
    fn test_distance() {
        let one = SeqNum::of(1);
        let five = SeqNum::of(5);

        assert_eq!(4, one.distance(five));
        assert_eq!(-4, five.distance(one));
        assert_eq!(0, five.distance(five));
        assert_eq!(5, SeqNum::INITIAL.distance(five));
        assert_eq!(i64::MAX, SeqNum::INITIAL.distance(SeqNum::of(u64::MAX)));
    }

    #[test]
    fn test_step() {
        let s = SeqNum::of(10);
        assert_eq!(SeqNum::of(13), s.step(3));
        assert_eq!(SeqNum::of(7), s.step(-3));
        assert_eq!(s, s.step(0));
    }

    #[test]
    fn test_display_is_decimal() {
        assert_eq!("0", SeqNum::INITIAL.to_string());
        assert_eq!("42", SeqNum::of(42).to_string());
    }

    #[test]
    fn test_sequencer_allocates_strictly_increasing() {
        let sequencer = Sequencer::new(Arc::new(MemoryCounter::new()));

        assert_eq!(SeqNum::INITIAL, sequencer.get());

        let first = sequencer.next();
        assert_eq!(SeqNum::of(1), first);

        let second = sequencer.next();
        assert!(second > first);
        assert_eq!(second, sequencer.get());
    }

    #[test]
    fn test_sequencer_unique_under_contention() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        let sequencer = Arc::new(Sequencer::new(Arc::new(MemoryCounter::new())));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sequencer = sequencer.clone();
            let seen = seen.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let allocated = sequencer.next();
                    assert!(seen.lock().unwrap().insert(allocated), "duplicate seq");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(4000, seen.lock().unwrap().len());
    }
}
