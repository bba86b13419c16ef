//! Sequential MAC address allocator shared by all machines of a run.

use std::sync::Mutex;

use netlab_common::models::HwAddr;

use crate::error::ControllerError;

#[derive(Debug)]
pub struct MacPool {
    last: u64,
    next: Mutex<Option<u64>>,
}

impl MacPool {
    /// Pool over the inclusive range `first..=last`.
    pub fn new(first: &HwAddr, last: &HwAddr) -> Result<Self, ControllerError> {
        let (Some(first), Some(last)) = (first.to_u64(), last.to_u64()) else {
            return Err(ControllerError::Config(
                "MAC pool bounds must be 6-byte addresses".into(),
            ));
        };
        if first > last {
            return Err(ControllerError::Config(
                "MAC pool start is above its end".into(),
            ));
        }
        Ok(Self {
            last,
            next: Mutex::new(Some(first)),
        })
    }

    pub fn alloc(&self) -> Result<HwAddr, ControllerError> {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let value = next.ok_or(ControllerError::MacPoolExhausted)?;
        *next = (value < self.last).then_some(value + 1);
        Ok(HwAddr::from_u64(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mac(s: &str) -> HwAddr {
        s.parse().unwrap()
    }

    #[test]
    fn allocates_in_order_until_exhausted() {
        let pool = MacPool::new(&mac("52:54:01:00:00:FE"), &mac("52:54:01:00:01:00")).unwrap();
        assert_eq!(pool.alloc().unwrap().to_string(), "52:54:01:00:00:FE");
        assert_eq!(pool.alloc().unwrap().to_string(), "52:54:01:00:00:FF");
        assert_eq!(pool.alloc().unwrap().to_string(), "52:54:01:00:01:00");
        assert!(matches!(pool.alloc(), Err(ControllerError::MacPoolExhausted)));
        assert!(matches!(pool.alloc(), Err(ControllerError::MacPoolExhausted)));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(MacPool::new(&mac("52:54:01:00:00:02"), &mac("52:54:01:00:00:01")).is_err());
        assert!(MacPool::new(&mac("52:54"), &mac("52:54:01:00:00:01")).is_err());
    }

    #[test]
    fn top_of_address_space_does_not_wrap() {
        let pool = MacPool::new(&mac("FF:FF:FF:FF:FF:FF"), &mac("FF:FF:FF:FF:FF:FF")).unwrap();
        assert!(pool.alloc().is_ok());
        assert!(pool.alloc().is_err());
    }

    proptest! {
        #[test]
        fn addresses_are_unique_and_in_range(start in 0u64..0xFFFF_FFFF_0000, len in 0u64..64) {
            let pool = MacPool::new(&HwAddr::from_u64(start), &HwAddr::from_u64(start + len)).unwrap();
            let got: Vec<u64> = std::iter::from_fn(|| pool.alloc().ok())
                .map(|m| m.to_u64().unwrap())
                .collect();
            prop_assert_eq!(got.len() as u64, len + 1);
            prop_assert!(got.windows(2).all(|w| w[0] + 1 == w[1]));
            prop_assert_eq!(got[0], start);
        }
    }
}
