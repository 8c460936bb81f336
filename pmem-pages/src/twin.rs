//! Twin pages and the diffing commit.
use std::num::NonZeroU32;

use parking_lot::Mutex;
use pmem_fd::PAGE_SIZE;

pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// Writers of a page that have not committed yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sharing {
    #[default]
    Unshared,
    Users(NonZeroU32),
}

impl Sharing {
    pub fn users(self) -> u32 {
        match self {
            Sharing::Unshared => 0,
            Sharing::Users(n) => n.get(),
        }
    }

    #[must_use]
    pub fn join(self) -> Self {
        let users = self.users().saturating_add(1);
        NonZeroU32::new(users).map_or(Sharing::Unshared, Sharing::Users)
    }

    #[must_use]
    pub fn leave(self) -> Self {
        let users = self.users().saturating_sub(1);
        NonZeroU32::new(users).map_or(Sharing::Unshared, Sharing::Users)
    }
}

/// Recycles page buffers for twins.
pub struct TwinPool {
    free: Mutex<Vec<PageBuf>>,
}

impl TwinPool {
    pub fn new() -> Self {
        TwinPool {
            free: Mutex::new(Vec::new()),
        }
    }

    /// A twin holding a copy of `page`.
    pub fn snapshot(&self, page: &[u8]) -> PageBuf {
        let mut twin = self.free.lock().pop().unwrap_or_else(|| Box::new([0; PAGE_SIZE]));
        twin.copy_from_slice(page);
        twin
    }

    pub fn release(&self, twin: PageBuf) {
        self.free.lock().push(twin);
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for TwinPool {
    fn default() -> Self {
        TwinPool::new()
    }
}

/// Copy the bytes of `local` that differ from `twin` into `dest`.
///
/// All other bytes of `dest` are left untouched, which keeps concurrent modifications of other
/// bytes committed there in the meantime. All three slices must have the same length.
pub fn diff_apply(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    assert!(local.len() == twin.len() && twin.len() == dest.len());
    diff_apply_fast(local, twin, dest)
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
fn diff_apply_fast(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    // Safety: lengths are equal, sse2 enabled at compile time.
    unsafe { diff_apply_sse2(local, twin, dest) }
}

#[cfg(not(all(target_arch = "x86_64", target_feature = "sse2")))]
fn diff_apply_fast(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    diff_apply_scalar(local, twin, dest)
}

/// The portable version of [`diff_apply`], one word at a time.
pub fn diff_apply_scalar(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    assert!(local.len() == twin.len() && twin.len() == dest.len());

    let words = local.len() / 8 * 8;
    for ((l, t), d) in local[..words]
        .chunks_exact(8)
        .zip(twin[..words].chunks_exact(8))
        .zip(dest[..words].chunks_exact_mut(8))
    {
        if l == t {
            continue;
        }

        for ((l, t), d) in l.iter().zip(t).zip(d) {
            if l != t {
                *d = *l;
            }
        }
    }

    for ((l, t), d) in local[words..]
        .iter()
        .zip(&twin[words..])
        .zip(&mut dest[words..])
    {
        if l != t {
            *d = *l;
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
unsafe fn diff_apply_sse2(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    use core::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_maskmoveu_si128, _mm_set1_epi8,
        _mm_sfence, _mm_xor_si128,
    };

    const LANES: usize = 16;
    let blocks = local.len() / LANES;
    let ones = _mm_set1_epi8(-1);

    for i in 0..blocks {
        let offset = i * LANES;
        let l = _mm_loadu_si128(local.as_ptr().add(offset) as *const __m128i);
        let t = _mm_loadu_si128(twin.as_ptr().add(offset) as *const __m128i);
        // High bit set in every lane where local and twin differ.
        let mask = _mm_xor_si128(_mm_cmpeq_epi8(l, t), ones);
        _mm_maskmoveu_si128(l, mask, dest.as_mut_ptr().add(offset) as *mut i8);
    }

    // The masked store is non-temporal.
    _mm_sfence();

    let tail = blocks * LANES;
    diff_apply_scalar(&local[tail..], &twin[tail..], &mut dest[tail..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sharing_counts_users() {
        let sharing = Sharing::default().join().join();
        assert_eq!(sharing.users(), 2);
        assert_eq!(sharing.leave().leave(), Sharing::Unshared);
        assert_eq!(Sharing::Unshared.leave(), Sharing::Unshared);
    }

    #[test]
    fn twins_are_recycled() {
        let pool = TwinPool::new();
        let page = [7u8; PAGE_SIZE];
        let twin = pool.snapshot(&page);
        assert_eq!(twin[..], page[..]);
        pool.release(twin);
        assert_eq!(pool.pooled(), 1);

        let other = pool.snapshot(&[1u8; PAGE_SIZE]);
        assert_eq!(pool.pooled(), 0);
        assert!(other.iter().all(|&b| b == 1));
    }

    /// Two writers of disjoint bytes of the same page, committing one after the other against
    /// the same twin.
    #[test]
    fn disjoint_writers_both_survive() {
        let twin = [0u8; PAGE_SIZE];
        let mut a = twin;
        let mut b = twin;
        a[..100].fill(0xaa);
        b[2000..2100].fill(0xbb);

        let mut dest = twin;
        diff_apply(&a, &twin, &mut dest);
        diff_apply(&b, &twin, &mut dest);

        assert!(dest[..100].iter().all(|&x| x == 0xaa));
        assert!(dest[2000..2100].iter().all(|&x| x == 0xbb));
        assert!(dest[100..2000].iter().all(|&x| x == 0));
    }

    proptest! {
        #[test]
        fn fast_and_portable_agree(
            local in prop::collection::vec(any::<u8>(), 0..300),
            seed in any::<u64>(),
        ) {
            // Derive twin and dest deterministically so that some bytes agree.
            let twin: Vec<u8> = local
                .iter()
                .enumerate()
                .map(|(i, &b)| if (seed >> (i % 64)) & 1 == 0 { b } else { b.wrapping_add(1) })
                .collect();
            let dest: Vec<u8> = (0..local.len()).map(|i| (i as u64 ^ seed) as u8).collect();

            let mut fast = dest.clone();
            let mut portable = dest.clone();
            diff_apply(&local, &twin, &mut fast);
            diff_apply_scalar(&local, &twin, &mut portable);
            prop_assert_eq!(&fast, &portable);

            for i in 0..local.len() {
                let expected = if local[i] != twin[i] { local[i] } else { dest[i] };
                prop_assert_eq!(fast[i], expected);
            }
        }

        #[test]
        fn disagreeing_twin_is_a_copy(local in prop::collection::vec(any::<u8>(), 0..300)) {
            let twin: Vec<u8> = local.iter().map(|b| !b).collect();
            let mut dest = vec![0x5a; local.len()];
            diff_apply(&local, &twin, &mut dest);
            prop_assert_eq!(dest, local);
        }
    }
}
