//! Large-memory allocator abstraction (spec section 9 "large-memory
//! allocator abstraction"). On the original target, C2/C3 are backed by
//! external PSRAM with a fallback to smaller internal RAM when PSRAM is
//! exhausted. This hosted port models that as a trait with two
//! backends — a `Vec`-backed stand-in on both sides, since there is no
//! real PSRAM to address here — plus a throttled fallback-warning logger
//! so repeated fallbacks don't flood the log.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

/// Reports current free memory for the two regions C5 watches (spec
/// section 4.5). A named external collaborator on the real target; here
/// it is mockable so tests can drive every tier transition deterministically.
pub trait MemorySource: Send + Sync {
    fn free_internal_bytes(&self) -> usize;
    fn free_external_bytes(&self) -> usize;
}

/// One of the two large-memory backends C2/C3 allocate from.
pub trait LargeMemoryAllocator: Send + Sync {
    /// Best-effort allocation of `size` bytes. `None` means this backend
    /// cannot currently satisfy the request.
    fn try_alloc(&self, size: usize) -> Option<Vec<u8>>;
    fn backend_name(&self) -> &'static str;
}

/// Stands in for the on-device external PSRAM allocator.
pub struct ExternalBackend;

impl LargeMemoryAllocator for ExternalBackend {
    fn try_alloc(&self, size: usize) -> Option<Vec<u8>> {
        // This would back onto external PSRAM on-device; on a hosted
        // target a plain heap allocation is the honest equivalent.
        Some(vec![0u8; size])
    }

    fn backend_name(&self) -> &'static str {
        "external"
    }
}

/// Stands in for the on-device internal RAM allocator — the fallback
/// when external memory is exhausted.
pub struct InternalBackend {
    /// Caps how large a single fallback allocation may be, mirroring the
    /// small internal-RAM budget (spec section 1, ~300KB).
    pub max_single_alloc: usize,
}

impl LargeMemoryAllocator for InternalBackend {
    fn try_alloc(&self, size: usize) -> Option<Vec<u8>> {
        if size > self.max_single_alloc {
            return None;
        }
        Some(vec![0u8; size])
    }

    fn backend_name(&self) -> &'static str {
        "internal"
    }
}

const FALLBACK_WARNING_THROTTLE: Duration = Duration::from_secs(30);

/// Tries `primary` (external) first, falling back to `fallback`
/// (internal) and logging the fallback at most once per throttle window.
pub struct FallbackAllocator {
    primary: Box<dyn LargeMemoryAllocator>,
    fallback: Box<dyn LargeMemoryAllocator>,
    last_warned: StdMutex<Option<Instant>>,
}

impl FallbackAllocator {
    pub fn new(primary: Box<dyn LargeMemoryAllocator>, fallback: Box<dyn LargeMemoryAllocator>) -> Self {
        Self { primary, fallback, last_warned: StdMutex::new(None) }
    }
}

impl LargeMemoryAllocator for FallbackAllocator {
    fn try_alloc(&self, size: usize) -> Option<Vec<u8>> {
        if let Some(buf) = self.primary.try_alloc(size) {
            return Some(buf);
        }

        let mut last = self.last_warned.lock().unwrap();
        let should_warn = last.map(|t| t.elapsed() >= FALLBACK_WARNING_THROTTLE).unwrap_or(true);
        if should_warn {
            tracing::warn!(
                target: "memory::allocator",
                "primary ({}) allocator exhausted, falling back to {}",
                self.primary.backend_name(),
                self.fallback.backend_name()
            );
            *last = Some(Instant::now());
        }

        self.fallback.try_alloc(size)
    }

    fn backend_name(&self) -> &'static str {
        self.fallback.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFailBackend;
    impl LargeMemoryAllocator for AlwaysFailBackend {
        fn try_alloc(&self, _size: usize) -> Option<Vec<u8>> {
            None
        }
        fn backend_name(&self) -> &'static str {
            "always-fail"
        }
    }

    #[test]
    fn falls_back_when_primary_exhausted() {
        let alloc = FallbackAllocator::new(Box::new(AlwaysFailBackend), Box::new(InternalBackend { max_single_alloc: 1024 }));
        let buf = alloc.try_alloc(512).expect("fallback should succeed");
        assert_eq!(buf.len(), 512);
    }

    #[test]
    fn internal_backend_rejects_oversized_allocations() {
        let backend = InternalBackend { max_single_alloc: 100 };
        assert!(backend.try_alloc(200).is_none());
        assert!(backend.try_alloc(50).is_some());
    }
}
