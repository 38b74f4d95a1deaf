//! A pointer + generation tag packed into a single 64-bit word.
//!
//! The Michael-Scott queue and the Treiber stack both need a double-word
//! compare-and-swap on `(pointer, counter)` pairs to defeat the ABA problem
//! when nodes are recycled through a pool. Stable Rust has no portable
//! 128-bit atomic, but on every target this crate supports, user-space
//! virtual addresses fit in 48 bits, leaving the top 16 bits of a 64-bit
//! word free for a generation counter. This is the same trick used by a
//! number of hand-rolled lock-free allocators; it is *not* portable to an
//! architecture with a full 64-bit address space, which is noted in
//! `DESIGN.md`.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

const PTR_BITS: u32 = 48;
const PTR_MASK: u64 = (1u64 << PTR_BITS) - 1;

#[inline]
fn pack(ptr: *mut (), tag: u16) -> u64 {
    (ptr as u64 & PTR_MASK) | ((tag as u64) << PTR_BITS)
}

#[inline]
fn unpack(word: u64) -> (*mut (), u16) {
    let ptr = (word & PTR_MASK) as *mut ();
    let tag = (word >> PTR_BITS) as u16;
    (ptr, tag)
}

/// An atomic `(*mut T, u16)` pair, CAS'd as a single 64-bit word.
pub(crate) struct TaggedAtomicPtr<T> {
    word: AtomicU64,
    _marker: PhantomData<*mut T>,
}

impl<T> TaggedAtomicPtr<T> {
    pub fn new(ptr: *mut T, tag: u16) -> Self {
        Self {
            word: AtomicU64::new(pack(ptr as *mut (), tag)),
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(ptr::null_mut(), 0)
    }

    pub fn load(&self, order: Ordering) -> (*mut T, u16) {
        let (ptr, tag) = unpack(self.word.load(order));
        (ptr as *mut T, tag)
    }

    pub fn compare_exchange_weak(
        &self,
        current: (*mut T, u16),
        new: (*mut T, u16),
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), (*mut T, u16)> {
        let current_word = pack(current.0 as *mut (), current.1);
        let new_word = pack(new.0 as *mut (), new.1);
        self.word
            .compare_exchange_weak(current_word, new_word, success, failure)
            .map(|_| ())
            .map_err(|w| {
                let (p, t) = unpack(w);
                (p as *mut T, t)
            })
    }
}
