//! Cycle timestamps tagged with the core that produced them.
//!
//! On x86_64 this is a single `rdtscp`, which also returns `IA32_TSC_AUX`;
//! Linux stores the CPU number in its low 12 bits. Elsewhere the timestamp
//! falls back to nanoseconds since a process epoch and the core comes from
//! `sched_getcpu`.

/// A cycle count and the core it was read on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub cycles: u64,
    pub cpu: u32,
}

impl Timestamp {
    /// Cycles elapsed since `earlier`.
    pub fn cycles_since(&self, earlier: &Timestamp) -> u64 {
        self.cycles.wrapping_sub(earlier.cycles)
    }

    /// Whether the two readings came from different cores.
    pub fn migrated_from(&self, earlier: &Timestamp) -> bool {
        self.cpu != earlier.cpu
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read() -> Timestamp {
    let mut aux = 0u32;
    // SAFETY: rdtscp has no memory side effects; `aux` is a valid out-pointer.
    let cycles = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
    Timestamp {
        cycles,
        cpu: aux & 0xfff,
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn read() -> Timestamp {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    let cpu = nix::sched::sched_getcpu().map(|cpu| cpu as u32).unwrap_or(0);
    Timestamp {
        cycles: epoch.elapsed().as_nanos() as u64,
        cpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_advance() {
        let start = read();
        let mut spin = 0u64;
        for i in 0..10_000u64 {
            spin = spin.wrapping_add(std::hint::black_box(i));
        }
        std::hint::black_box(spin);
        let end = read();
        assert!(end.cycles_since(&start) > 0);
    }

    #[test]
    fn migration_compares_cores() {
        let a = Timestamp { cycles: 10, cpu: 1 };
        let b = Timestamp { cycles: 30, cpu: 1 };
        let c = Timestamp { cycles: 30, cpu: 2 };
        assert!(!b.migrated_from(&a));
        assert!(c.migrated_from(&a));
        assert_eq!(b.cycles_since(&a), 20);
    }
}
