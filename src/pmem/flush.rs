use crate::sync::AtomicU64;
use std::sync::OnceLock;

pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Cache flush instructions, from most to least preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMethod {
    /// CLWB - write the line back without evicting it
    Clwb,
    /// CLFLUSHOPT - evicting, weakly ordered
    ClflushOpt,
    /// CLFLUSH - evicting, strongly ordered
    Clflush,
    /// No flush instruction is available; only a fence is issued.
    Fence,
}

static FLUSH_METHOD: OnceLock<FlushMethod> = OnceLock::new();

/// Detect the best available cache flush method using CPUID.
pub fn detect_flush_method() -> FlushMethod {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::__cpuid;

        // CPUID.07H:EBX bit 24 is CLWB, bit 23 is CLFLUSHOPT
        let cpuid_7 = unsafe { __cpuid(7) };
        if cpuid_7.ebx & (1 << 24) != 0 {
            return FlushMethod::Clwb;
        }
        if cpuid_7.ebx & (1 << 23) != 0 {
            return FlushMethod::ClflushOpt;
        }
        FlushMethod::Clflush
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        FlushMethod::Fence
    }
}

pub(crate) fn flush_method() -> FlushMethod {
    *FLUSH_METHOD.get_or_init(detect_flush_method)
}

/// Write back every cache line overlapping `[addr, addr + len)`.
///
/// # Safety
///
/// `addr` must point to `len` readable bytes.
#[inline]
unsafe fn flush(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let method: FlushMethod = flush_method();
    let end: usize = addr as usize + len;
    let mut line: usize = addr as usize & !(CACHE_LINE_SIZE - 1);
    while line < end {
        flush_line(method, line as *const u8);
        line += CACHE_LINE_SIZE;
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn flush_line(method: FlushMethod, line: *const u8) {
    match method {
        FlushMethod::Clwb => {
            std::arch::asm!("clwb [{addr}]", addr = in(reg) line, options(nostack));
        }
        FlushMethod::ClflushOpt => {
            std::arch::asm!("clflushopt [{addr}]", addr = in(reg) line, options(nostack));
        }
        FlushMethod::Clflush => {
            std::arch::asm!("clflush [{addr}]", addr = in(reg) line, options(nostack));
        }
        FlushMethod::Fence => {}
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
unsafe fn flush_line(_method: FlushMethod, _line: *const u8) {}

/// Order all previous flushes before any later store.
#[inline]
fn drain() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("sfence", options(nostack));
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Make the current value of `word` durable.
#[inline]
pub(crate) fn persist_word(word: &AtomicU64) {
    let addr: *const u8 = (word as *const AtomicU64).cast();
    unsafe { flush(addr, core::mem::size_of::<AtomicU64>()) };
    drain();
    #[cfg(all(test, not(feature = "shuttle")))]
    persisted::record(core::slice::from_ref(word));
}

/// Make the current values of a run of contiguous words durable with a single fence.
#[inline]
pub(crate) fn persist_words(words: &[AtomicU64]) {
    let addr: *const u8 = words.as_ptr().cast();
    unsafe { flush(addr, core::mem::size_of_val(words)) };
    drain();
    #[cfg(all(test, not(feature = "shuttle")))]
    persisted::record(words);
}
