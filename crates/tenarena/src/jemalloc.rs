//! Thin facade over jemalloc's non-standard `*allocx` entry points and the
//! `mallctl` control namespace.
//!
//! jemalloc publishes the `MALLOCX_*` flag encodings only as C macros, so the
//! arena/tcache arithmetic is reproduced here: an arena id occupies the flag
//! bits above [`ARENA_SHIFT`] (stored off-by-one so that 0 means "no arena")
//! and a tcache id occupies bits 8.. (stored off-by-two so that special values
//! fit below).

use std::ffi::{c_int, c_uint, c_void, CStr};
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use tikv_jemalloc_sys as sys;
use tracing::info;

use crate::error::Error;

/// `MALLOCX_ZERO`: the returned memory is zeroed.
pub const MALLOCX_ZERO: c_int = 0x40;

/// `MALLOCX_TCACHE_NONE`: bypass all thread caches, i.e. `MALLOCX_TCACHE(-1)`.
pub const MALLOCX_TCACHE_NONE: c_int = 1 << TCACHE_SHIFT;

const ARENA_SHIFT: u32 = 20;
const TCACHE_SHIFT: u32 = 8;

/// `MALLOCX_ARENA(arena)`: allocate from the given arena.
///
/// The field occupies the top bits of the flags word and wraps into the sign
/// bit for high arena ids, exactly as the C macro does; all arithmetic is
/// done unsigned so no bits are lost either way.
#[inline]
pub fn arena_flags(arena: u16) -> c_int {
    ((arena as u32 + 1) << ARENA_SHIFT) as c_int
}

/// `MALLOCX_TCACHE(tcache)`: allocate through an explicitly created tcache.
#[inline]
pub fn tcache_flags(tcache: u16) -> c_int {
    ((tcache as u32 + 2) << TCACHE_SHIFT) as c_int
}

/// Recover the arena id encoded in a flags word, if any.
#[inline]
pub fn arena_from_flags(flags: c_int) -> Option<u16> {
    let bits = flags as u32 >> ARENA_SHIFT;
    (bits > 0).then(|| (bits - 1) as u16)
}

#[inline]
pub unsafe fn mallocx(size: usize, flags: c_int) -> *mut c_void {
    sys::mallocx(size, flags)
}

#[inline]
pub unsafe fn rallocx(ptr: *mut c_void, size: usize, flags: c_int) -> *mut c_void {
    sys::rallocx(ptr, size, flags)
}

#[inline]
pub unsafe fn dallocx(ptr: *mut c_void, flags: c_int) {
    sys::dallocx(ptr, flags)
}

#[inline]
pub unsafe fn sdallocx(ptr: *mut c_void, size: usize, flags: c_int) {
    sys::sdallocx(ptr, size, flags)
}

/// Real size of the allocation behind `ptr`.
#[inline]
pub unsafe fn sallocx(ptr: *mut c_void, flags: c_int) -> usize {
    sys::sallocx(ptr, flags)
}

/// Real size that an allocation request of `size` would be rounded up to.
#[inline]
pub fn nallocx(size: usize, flags: c_int) -> usize {
    unsafe { sys::nallocx(size, flags) }
}

/// `arenas.create`: a fresh arena, identified by a nonzero index.
pub fn create_arena() -> Result<u16, Error> {
    let mut arena: c_uint = 0;
    let mut len = mem::size_of::<c_uint>();
    let rv = unsafe {
        sys::mallctl(
            c"arenas.create".as_ptr(),
            &mut arena as *mut c_uint as *mut c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rv != 0 {
        return Err(Error::Backend {
            op: "arenas.create",
            code: rv,
        });
    }
    let arena = u16::try_from(arena).map_err(|_| Error::Backend {
        op: "arenas.create",
        code: -1,
    })?;
    info!(arena, "created jemalloc arena");
    Ok(arena)
}

/// `tcache.create`: an explicit thread cache owned by the calling thread.
pub fn create_tcache() -> Result<u16, Error> {
    let mut tcache: c_uint = 0;
    let mut len = mem::size_of::<c_uint>();
    let rv = unsafe {
        sys::mallctl(
            c"tcache.create".as_ptr(),
            &mut tcache as *mut c_uint as *mut c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rv != 0 {
        return Err(Error::Backend {
            op: "tcache.create",
            code: rv,
        });
    }
    u16::try_from(tcache).map_err(|_| Error::Backend {
        op: "tcache.create",
        code: -1,
    })
}

/// `tcache.destroy`: release a thread cache created by [`create_tcache`].
pub fn destroy_tcache(tcache: u16) -> Result<(), Error> {
    let mut tcache: c_uint = tcache as c_uint;
    let rv = unsafe {
        sys::mallctl(
            c"tcache.destroy".as_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            &mut tcache as *mut c_uint as *mut c_void,
            mem::size_of::<c_uint>(),
        )
    };
    if rv != 0 {
        return Err(Error::Backend {
            op: "tcache.destroy",
            code: rv,
        });
    }
    Ok(())
}

/// Bytes currently allocated from `arena`, per jemalloc's own stats.
///
/// Refreshes the stats epoch, then reads the arena's small and large totals
/// through MIBs resolved once and cached.
pub fn allocated_for_arena(arena: u16) -> Result<usize, Error> {
    refresh_epoch()?;
    let small = read_arena_stat(small_mib(), arena)?;
    let large = read_arena_stat(large_mib(), arena)?;
    Ok(small + large)
}

/// Advance the `epoch` so subsequent stats reads see current values.
fn refresh_epoch() -> Result<(), Error> {
    let mut epoch: u64 = 1;
    let mut len = mem::size_of::<u64>();
    let rv = unsafe {
        sys::mallctl(
            c"epoch".as_ptr(),
            &mut epoch as *mut u64 as *mut c_void,
            &mut len,
            &mut epoch as *mut u64 as *mut c_void,
            len,
        )
    };
    if rv != 0 {
        return Err(Error::Backend {
            op: "epoch",
            code: rv,
        });
    }
    Ok(())
}

/// MIB for a `stats.arenas.<i>.*` name; component 2 is the arena index.
type StatMib = [usize; 5];

fn small_mib() -> &'static StatMib {
    static MIB: OnceLock<StatMib> = OnceLock::new();
    MIB.get_or_init(|| resolve_mib(c"stats.arenas.0.small.allocated"))
}

fn large_mib() -> &'static StatMib {
    static MIB: OnceLock<StatMib> = OnceLock::new();
    MIB.get_or_init(|| resolve_mib(c"stats.arenas.0.large.allocated"))
}

fn resolve_mib(name: &CStr) -> StatMib {
    let mut mib: StatMib = [0; 5];
    let mut len = mib.len();
    let rv = unsafe { sys::mallctlnametomib(name.as_ptr(), mib.as_mut_ptr(), &mut len) };
    assert_eq!(rv, 0, "mallctlnametomib({name:?}) failed: {rv}");
    mib
}

fn read_arena_stat(mib: &StatMib, arena: u16) -> Result<usize, Error> {
    let mut mib = *mib;
    mib[2] = arena as usize;
    let mut value: usize = 0;
    let mut len = mem::size_of::<usize>();
    let rv = unsafe {
        sys::mallctlbymib(
            mib.as_ptr(),
            mib.len(),
            &mut value as *mut usize as *mut c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rv != 0 {
        return Err(Error::Backend {
            op: "stats.arenas.N.allocated",
            code: rv,
        });
    }
    Ok(value)
}
