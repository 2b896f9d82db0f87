//! Overlay address allocation
//!
//! Hands out unique overlay addresses from a client range (7.0.0.0/8 by
//! default). Addresses are picked at random so that consecutive accounts do
//! not receive guessable neighbours. The network and broadcast addresses of
//! the range are never assigned.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::RwLock;
use rand::Rng;

/// Default client overlay range
pub const DEFAULT_CLIENT_RANGE: &str = "7.0.0.0/8";

/// Random probes before falling back to a linear scan
const RANDOM_ATTEMPTS: usize = 64;

/// Error types for overlay address allocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// No addresses left in the range
    #[error("No available overlay addresses in {0}")]
    Exhausted(Ipv4Net),

    /// Address is already assigned
    #[error("Overlay address {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    /// Address is the network or broadcast address of the range
    #[error("Overlay address {0} is reserved")]
    Reserved(Ipv4Addr),

    /// Address lies outside the range
    #[error("Overlay address {0} is not in {1}")]
    OutOfRange(Ipv4Addr, Ipv4Net),
}

/// True if `addr` may be assigned to a client from `range`.
///
/// For ranges of /31 and /32 every address is assignable; otherwise the
/// network and broadcast addresses are excluded.
#[must_use]
pub fn is_assignable(range: &Ipv4Net, addr: Ipv4Addr) -> bool {
    if !range.contains(&addr) {
        return false;
    }
    if range.prefix_len() >= 31 {
        return true;
    }
    addr != range.network() && addr != range.broadcast()
}

/// Allocator of unique overlay addresses within one range
#[derive(Debug)]
pub struct AddressAllocator {
    range: Ipv4Net,
    allocated: RwLock<HashSet<Ipv4Addr>>,
}

impl AddressAllocator {
    /// Create an allocator for `range`
    #[must_use]
    pub fn new(range: Ipv4Net) -> Self {
        Self {
            range: range.trunc(),
            allocated: RwLock::new(HashSet::new()),
        }
    }

    /// The managed range
    #[must_use]
    pub const fn range(&self) -> Ipv4Net {
        self.range
    }

    fn assignable_bounds(&self) -> (u32, u32) {
        let first = u32::from(self.range.network());
        let last = u32::from(self.range.broadcast());
        if self.range.prefix_len() >= 31 {
            (first, last)
        } else {
            (first + 1, last - 1)
        }
    }

    /// Allocate a random unused address.
    ///
    /// # Errors
    ///
    /// Returns `AllocatorError::Exhausted` if every assignable address is
    /// taken.
    pub fn allocate(&self) -> Result<Ipv4Addr, AllocatorError> {
        let (low, high) = self.assignable_bounds();
        let mut allocated = self.allocated.write();
        let mut rng = rand::thread_rng();

        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = Ipv4Addr::from(rng.gen_range(low..=high));
            if allocated.insert(candidate) {
                return Ok(candidate);
            }
        }

        // Nearly full: scan from a random starting point
        let span = u64::from(high - low) + 1;
        let start = rng.gen_range(0..span);
        for offset in 0..span {
            let candidate = Ipv4Addr::from(low + ((start + offset) % span) as u32);
            if allocated.insert(candidate) {
                return Ok(candidate);
            }
        }

        Err(AllocatorError::Exhausted(self.range))
    }

    /// Reserve a specific address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is outside the range, reserved, or
    /// already allocated.
    pub fn allocate_specific(&self, addr: Ipv4Addr) -> Result<(), AllocatorError> {
        if !self.range.contains(&addr) {
            return Err(AllocatorError::OutOfRange(addr, self.range));
        }
        if !is_assignable(&self.range, addr) {
            return Err(AllocatorError::Reserved(addr));
        }
        if !self.allocated.write().insert(addr) {
            return Err(AllocatorError::AlreadyAllocated(addr));
        }
        Ok(())
    }

    /// Return an address to the pool
    pub fn release(&self, addr: Ipv4Addr) -> bool {
        self.allocated.write().remove(&addr)
    }

    /// Number of allocated addresses
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_network_and_broadcast_not_assignable() {
        let range = net("10.0.0.0/24");
        assert!(!is_assignable(&range, Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!is_assignable(&range, Ipv4Addr::new(10, 0, 0, 255)));
        assert!(is_assignable(&range, Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!is_assignable(&range, Ipv4Addr::new(10, 0, 1, 1)));
    }

    #[test]
    fn test_allocate_exhausts_small_range() {
        let allocator = AddressAllocator::new(net("10.9.0.0/29"));
        let mut seen = HashSet::new();
        for _ in 0..6 {
            let addr = allocator.allocate().unwrap();
            assert!(is_assignable(&allocator.range(), addr));
            assert!(seen.insert(addr));
        }
        assert_eq!(
            allocator.allocate(),
            Err(AllocatorError::Exhausted(net("10.9.0.0/29")))
        );

        assert!(allocator.release(*seen.iter().next().unwrap()));
        assert!(allocator.allocate().is_ok());
    }

    #[test]
    fn test_allocate_specific() {
        let allocator = AddressAllocator::new(net(DEFAULT_CLIENT_RANGE));
        let addr = Ipv4Addr::new(7, 1, 2, 3);

        allocator.allocate_specific(addr).unwrap();
        assert_eq!(
            allocator.allocate_specific(addr),
            Err(AllocatorError::AlreadyAllocated(addr))
        );
        assert_eq!(
            allocator.allocate_specific(Ipv4Addr::new(7, 0, 0, 0)),
            Err(AllocatorError::Reserved(Ipv4Addr::new(7, 0, 0, 0)))
        );
        assert!(matches!(
            allocator.allocate_specific(Ipv4Addr::new(8, 0, 0, 1)),
            Err(AllocatorError::OutOfRange(..))
        ));
        assert_eq!(allocator.allocated_count(), 1);
    }
}
