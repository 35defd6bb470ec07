//! Self-monitoring perf counters read from user space.
//!
//! Each thread lazily opens one counter per [`CounterKind`] for itself
//! (`pid = 0, cpu = -1`), maps the event's metadata page and resets and
//! enables it. Reads take the `rdpmc` fast path guarded by the page's
//! sequence lock, and fall back to `read(2)` on the event fd when the kernel
//! does not allow user-space register reads.

use super::CounterKind;
use crate::error::{Error, Result};
use libc::{SYS_perf_event_open, c_int, c_ulong, pid_t, syscall};
use memmap2::{Mmap, MmapOptions};
use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{Ordering, fence};

// perf_event constants (from linux/perf_event.h)
const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
const PERF_EVENT_IOC_RESET: u64 = 0x2403;

/// Hardware counters are 48 bits wide; every value is reduced to that width.
pub const COUNTER_MASK: u64 = (1 << 48) - 1;

/// Baselines above this are close enough to wrapping that the counter is
/// reset before use.
pub const OVERFLOW_MARGIN: u64 = COUNTER_MASK / 2;

/// Upper bound on sequence-lock retries before a read is abandoned.
pub const MAX_SEQLOCK_ATTEMPTS: u32 = 64;

/// perf_event_attr structure
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl PerfEventAttr {
    const DISABLED_BIT: u64 = 1 << 0;
    const EXCLUDE_KERNEL_BIT: u64 = 1 << 5;
    const EXCLUDE_HV_BIT: u64 = 1 << 6;

    pub fn new() -> Self {
        PerfEventAttr {
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            ..Default::default()
        }
    }

    /// Counting attributes for `kind`: starts disabled, user space only.
    pub fn for_kind(kind: CounterKind) -> Self {
        let mut attr = Self::new();
        (attr.type_, attr.config) = match kind {
            CounterKind::CacheMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
            CounterKind::BranchMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
            CounterKind::Instructions => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
            CounterKind::PageFaults => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
        };
        attr.set_flag(Self::DISABLED_BIT, true);
        attr.set_flag(Self::EXCLUDE_KERNEL_BIT, true);
        attr.set_flag(Self::EXCLUDE_HV_BIT, true);
        attr
    }

    fn set_flag(&mut self, bit: u64, val: bool) {
        if val {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }
}

/// Leading fields of perf_event_mmap_page used by self-monitoring reads.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
}

/// Read access to the fields the sequence-lock protocol touches.
pub(crate) trait CounterPage {
    fn lock(&self) -> u32;
    fn index(&self) -> u32;
    fn offset(&self) -> i64;
}

#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
struct MappedPage<'a> {
    map: &'a Mmap,
}

impl MappedPage<'_> {
    fn page(&self) -> *const PerfEventMmapPage {
        self.map.as_ptr() as *const PerfEventMmapPage
    }
}

// The kernel updates these fields concurrently, so every access is volatile.
impl CounterPage for MappedPage<'_> {
    fn lock(&self) -> u32 {
        // SAFETY: the mapping is at least one page and outlives `self`.
        unsafe { std::ptr::addr_of!((*self.page()).lock).read_volatile() }
    }

    fn index(&self) -> u32 {
        // SAFETY: as above.
        unsafe { std::ptr::addr_of!((*self.page()).index).read_volatile() }
    }

    fn offset(&self) -> i64 {
        // SAFETY: as above.
        unsafe { std::ptr::addr_of!((*self.page()).offset).read_volatile() }
    }
}

/// Outcome of one sequence-locked read of the metadata page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FastRead {
    Count(u64),
    /// Index 0: user-space `rdpmc` is not permitted for this event.
    Disallowed,
}

/// Read the counter through the metadata page.
///
/// Retries while the sequence lock moves under the read, up to
/// `max_attempts`; returns `None` if it never settles.
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
pub(crate) fn seqlock_read<P: CounterPage>(
    page: &P,
    max_attempts: u32,
    mut read_pmc: impl FnMut(u32) -> u64,
) -> Option<FastRead> {
    for _ in 0..max_attempts {
        let seq = page.lock();
        fence(Ordering::Acquire);

        let index = page.index();
        let offset = page.offset();
        if index == 0 {
            return Some(FastRead::Disallowed);
        }
        let count = read_pmc(index - 1);

        fence(Ordering::Acquire);
        if page.lock() == seq {
            return Some(FastRead::Count(
                (count as i64).wrapping_add(offset) as u64 & COUNTER_MASK,
            ));
        }
    }
    None
}

/// Whether a baseline is close enough to wrapping to force a reset.
pub fn needs_reset(value: u64) -> bool {
    value > OVERFLOW_MARGIN
}

/// Events counted between two 48-bit readings, tolerating one wrap.
pub fn counter_delta(start: u64, end: u64) -> u64 {
    end.wrapping_sub(start) & COUNTER_MASK
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn rdpmc(index: u32) -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: only called with an index the kernel published in the metadata
    // page, which it does only when user-space rdpmc is enabled.
    unsafe {
        core::arch::asm!(
            "rdpmc",
            in("ecx") index,
            out("eax") lo,
            out("edx") hi,
            options(nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// One perf event counting for the calling thread.
pub struct PerfCounter {
    kind: CounterKind,
    file: File,
    page: Mmap,
}

impl PerfCounter {
    /// Open, map, reset and enable a counter for the calling thread.
    pub fn open(kind: CounterKind) -> Result<Self> {
        let attr = PerfEventAttr::for_kind(kind);

        let fd = unsafe {
            syscall(
                SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                0 as pid_t,  // calling thread
                -1 as c_int, // any CPU
                -1 as c_int, // no group
                PERF_FLAG_FD_CLOEXEC,
            )
        };

        if fd < 0 {
            let source = io::Error::last_os_error();
            if matches!(source.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM)) {
                warn_perf_paranoid();
            }
            return Err(Error::CounterOpen { kind, source });
        }

        // SAFETY: `fd` was just returned by perf_event_open and is owned here.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd as c_int) });

        // SAFETY: the metadata page is read-only for us and lives as long as `file`.
        let page = unsafe { MmapOptions::new().len(page_size()).map(&file) }
            .map_err(|source| Error::CounterMap { kind, source })?;

        let counter = PerfCounter { kind, file, page };
        counter.ioctl(PERF_EVENT_IOC_RESET)?;
        counter.ioctl(PERF_EVENT_IOC_ENABLE)?;
        log::debug!("opened {} counter (fd {})", kind, counter.file.as_raw_fd());
        Ok(counter)
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    /// Zero the event count.
    pub fn reset(&self) -> Result<()> {
        self.ioctl(PERF_EVENT_IOC_RESET)
    }

    /// Current count, masked to 48 bits.
    pub fn read(&self) -> Result<u64> {
        match self.fast_read() {
            Some(FastRead::Count(value)) => Ok(value),
            Some(FastRead::Disallowed) => self.read_syscall(),
            None => Err(Error::SeqlockContention {
                kind: self.kind,
                attempts: MAX_SEQLOCK_ATTEMPTS,
            }),
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn fast_read(&self) -> Option<FastRead> {
        seqlock_read(&MappedPage { map: &self.page }, MAX_SEQLOCK_ATTEMPTS, rdpmc)
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn fast_read(&self) -> Option<FastRead> {
        Some(FastRead::Disallowed)
    }

    fn read_syscall(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        (&self.file).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf) & COUNTER_MASK)
    }

    fn ioctl(&self, request: u64) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, 0) };
        if ret < 0 {
            return Err(Error::CounterControl {
                kind: self.kind,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for PerfCounter {
    fn drop(&mut self) {
        let _ = self.ioctl(PERF_EVENT_IOC_DISABLE);
    }
}

fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|size| size as usize)
        .unwrap_or(4096)
}

/// Check /proc/sys/kernel/perf_event_paranoid after a permission failure.
fn warn_perf_paranoid() {
    let path = "/proc/sys/kernel/perf_event_paranoid";
    if let Ok(content) = fs::read_to_string(path) {
        let level: i32 = content.trim().parse().unwrap_or(2);
        if level > 1 {
            log::warn!(
                "perf_event_paranoid={level}; hardware counters need: sudo sysctl kernel.perf_event_paranoid=1"
            );
        }
    }
}

/// Event source behind a thread's baseline bookkeeping.
trait EventCounter {
    fn kind(&self) -> CounterKind;
    fn read(&self) -> Result<u64>;
    fn reset(&self) -> Result<()>;
}

impl EventCounter for PerfCounter {
    fn kind(&self) -> CounterKind {
        self.kind
    }

    fn read(&self) -> Result<u64> {
        PerfCounter::read(self)
    }

    fn reset(&self) -> Result<()> {
        PerfCounter::reset(self)
    }
}

struct ThreadCounter<C = PerfCounter> {
    counter: C,
    /// Measurements on this thread currently holding a baseline.
    active: u32,
}

impl<C: EventCounter> ThreadCounter<C> {
    fn new(counter: C) -> Self {
        ThreadCounter { counter, active: 0 }
    }

    /// Take a baseline. With no other baseline outstanding, a count past
    /// [`OVERFLOW_MARGIN`] is reset first and the baseline is zero.
    fn acquire(&mut self) -> Result<u64> {
        let value = self.counter.read()?;
        let baseline = if self.active == 0 && needs_reset(value) {
            log::debug!(
                "{} counter at {value}, resetting before it wraps",
                self.counter.kind()
            );
            self.counter.reset()?;
            0
        } else {
            value
        };
        self.active += 1;
        Ok(baseline)
    }

    fn release(&mut self, baseline: u64) -> Result<u64> {
        self.active = self.active.saturating_sub(1);
        let now = self.counter.read()?;
        Ok(counter_delta(baseline, now))
    }
}

thread_local! {
    static THREAD_COUNTERS: RefCell<[Option<ThreadCounter>; CounterKind::COUNT]> =
        const { RefCell::new([None, None, None, None]) };
}

/// Capture a baseline for `kind` on the calling thread, opening the counter
/// on first use.
///
/// When no other measurement on this thread holds a baseline for `kind` and
/// the count is past [`OVERFLOW_MARGIN`], the counter is reset and the
/// baseline is zero.
pub fn begin(kind: CounterKind) -> Result<u64> {
    THREAD_COUNTERS.with(|cell| {
        let mut table = cell.borrow_mut();
        let slot = &mut table[kind.index()];
        let entry = match slot.take() {
            Some(entry) => entry,
            None => ThreadCounter::new(PerfCounter::open(kind)?),
        };
        slot.insert(entry).acquire()
    })
}

/// Release a baseline taken by [`begin`] and return the delta since it.
///
/// `Ok(None)` means the thread's counters are already gone (thread teardown).
pub fn end(kind: CounterKind, baseline: u64) -> Result<Option<u64>> {
    THREAD_COUNTERS
        .try_with(|cell| {
            let mut table = cell.borrow_mut();
            match table[kind.index()].as_mut() {
                Some(entry) => entry.release(baseline).map(Some),
                None => Ok(None),
            }
        })
        .unwrap_or(Ok(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Metadata page whose lock advances during the first `unstable` reads.
    struct FakePage {
        lock: Cell<u32>,
        index: u32,
        offset: i64,
        unstable: Cell<u32>,
    }

    impl FakePage {
        fn new(index: u32, offset: i64, unstable: u32) -> Self {
            FakePage {
                lock: Cell::new(0),
                index,
                offset,
                unstable: Cell::new(unstable),
            }
        }
    }

    impl CounterPage for FakePage {
        fn lock(&self) -> u32 {
            let seq = self.lock.get();
            if self.unstable.get() > 0 {
                self.unstable.set(self.unstable.get() - 1);
                self.lock.set(seq + 1);
            }
            seq
        }

        fn index(&self) -> u32 {
            self.index
        }

        fn offset(&self) -> i64 {
            self.offset
        }
    }

    #[test]
    fn stable_page_reads_once() {
        let page = FakePage::new(3, 100, 0);
        let mut calls = Vec::new();
        let read = seqlock_read(&page, 8, |idx| {
            calls.push(idx);
            50
        });
        assert_eq!(read, Some(FastRead::Count(150)));
        assert_eq!(calls, vec![2]);
    }

    #[test]
    fn moving_lock_retries_until_stable() {
        let page = FakePage::new(1, 0, 3);
        let mut calls = 0;
        let read = seqlock_read(&page, 8, |_| {
            calls += 1;
            7
        });
        assert_eq!(read, Some(FastRead::Count(7)));
        assert!(calls > 1);
    }

    #[test]
    fn retries_are_bounded() {
        let page = FakePage::new(1, 0, u32::MAX);
        assert_eq!(seqlock_read(&page, 5, |_| 1), None);
    }

    #[test]
    fn index_zero_disallows_register_reads() {
        let page = FakePage::new(0, 0, 0);
        let read = seqlock_read(&page, 8, |_| panic!("rdpmc must not run"));
        assert_eq!(read, Some(FastRead::Disallowed));
    }

    #[test]
    fn negative_offset_and_mask_apply() {
        let page = FakePage::new(1, -10, 0);
        let read = seqlock_read(&page, 8, |_| 4);
        assert_eq!(read, Some(FastRead::Count((-6i64) as u64 & COUNTER_MASK)));
    }

    #[test]
    fn baseline_past_half_range_needs_reset() {
        assert!(!needs_reset(0));
        assert!(!needs_reset(OVERFLOW_MARGIN));
        assert!(needs_reset(OVERFLOW_MARGIN + 1));
        assert!(needs_reset(COUNTER_MASK));
    }

    #[test]
    fn delta_survives_one_wrap() {
        assert_eq!(counter_delta(10, 25), 15);
        assert_eq!(counter_delta(COUNTER_MASK - 4, 5), 10);
    }

    #[test]
    fn attributes_exclude_kernel_and_hypervisor() {
        let attr = PerfEventAttr::for_kind(CounterKind::PageFaults);
        assert_eq!(attr.type_, PERF_TYPE_SOFTWARE);
        assert_eq!(attr.config, PERF_COUNT_SW_PAGE_FAULTS);
        assert_eq!(attr.flags & PerfEventAttr::DISABLED_BIT, PerfEventAttr::DISABLED_BIT);
        assert_ne!(attr.flags & PerfEventAttr::EXCLUDE_KERNEL_BIT, 0);
        assert_ne!(attr.flags & PerfEventAttr::EXCLUDE_HV_BIT, 0);
        assert_eq!(attr.size as usize, std::mem::size_of::<PerfEventAttr>());
    }

    /// Counter whose value the test moves by hand.
    struct FakeCounter {
        value: Cell<u64>,
        resets: Cell<u32>,
    }

    impl FakeCounter {
        fn at(value: u64) -> Self {
            FakeCounter {
                value: Cell::new(value),
                resets: Cell::new(0),
            }
        }

        fn advance(&self, by: u64) {
            self.value.set((self.value.get() + by) & COUNTER_MASK);
        }
    }

    impl EventCounter for FakeCounter {
        fn kind(&self) -> CounterKind {
            CounterKind::Instructions
        }

        fn read(&self) -> Result<u64> {
            Ok(self.value.get())
        }

        fn reset(&self) -> Result<()> {
            self.value.set(0);
            self.resets.set(self.resets.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn high_count_is_reset_for_first_baseline() {
        let mut entry = ThreadCounter::new(FakeCounter::at(OVERFLOW_MARGIN + 5));
        assert_eq!(entry.acquire().unwrap(), 0);
        assert_eq!(entry.counter.resets.get(), 1);
        assert_eq!(entry.active, 1);
    }

    #[test]
    fn nested_baseline_never_resets() {
        let mut entry = ThreadCounter::new(FakeCounter::at(100));
        let outer = entry.acquire().unwrap();
        entry.counter.advance(OVERFLOW_MARGIN);

        let inner = entry.acquire().unwrap();
        assert_eq!(inner, OVERFLOW_MARGIN + 100);
        assert_eq!(entry.counter.resets.get(), 0);

        entry.counter.advance(3);
        assert_eq!(entry.release(inner).unwrap(), 3);
        assert_eq!(entry.release(outer).unwrap(), OVERFLOW_MARGIN + 3);
        assert_eq!(entry.active, 0);
    }

    #[test]
    fn delta_after_reset_counts_from_zero() {
        let mut entry = ThreadCounter::new(FakeCounter::at(COUNTER_MASK - 2));
        let baseline = entry.acquire().unwrap();
        entry.counter.advance(7);
        assert_eq!(entry.release(baseline).unwrap(), 7);

        // The next measurement starts low again and leaves the counter alone.
        let baseline = entry.acquire().unwrap();
        assert_eq!(baseline, 7);
        assert_eq!(entry.counter.resets.get(), 1);
    }

    #[test]
    fn page_fault_counter_counts_when_permitted() {
        // Software event; still skipped where perf_event_open is locked down.
        let Ok(counter) = PerfCounter::open(CounterKind::PageFaults) else {
            return;
        };
        // Fresh anonymous pages fault on first touch.
        let mut pages = memmap2::MmapMut::map_anon(64 * 4096).unwrap();
        let before = counter.read().unwrap();
        for page in pages.chunks_mut(4096) {
            page[0] = 1;
        }
        std::hint::black_box(&pages[..]);
        let after = counter.read().unwrap();
        assert!(counter_delta(before, after) > 0);
    }
}
