//! The orderbook trie key: price ‖ owner ‖ offer_id, big-endian, sorted so
//! that a trie traversal visits offers in ascending minimum-price order.

use crate::price::Price;
use crate::trie::{KeyPrefix, OrderbookPrefix, ORDERBOOK_KEY_BYTES};

/// Logical 22-byte key (price:6 ‖ owner:8 ‖ offer_id:8), carried in the
/// trie's 24-byte wire representation — see `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderbookKey {
    pub price: Price,
    pub owner: u64,
    pub offer_id: u64,
}

impl OrderbookKey {
    pub fn to_bytes(self) -> [u8; ORDERBOOK_KEY_BYTES] {
        let mut out = [0u8; ORDERBOOK_KEY_BYTES];
        // top 2 bytes reserved, always zero.
        self.price.write_big_endian(&mut out[2..8]);
        out[8..16].copy_from_slice(&self.owner.to_be_bytes());
        out[16..24].copy_from_slice(&self.offer_id.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; ORDERBOOK_KEY_BYTES]) -> Self {
        let price = Price::read_big_endian(&bytes[2..8]);
        let owner = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let offer_id = u64::from_be_bytes(bytes[16..24].try_into().unwrap());
        OrderbookKey {
            price,
            owner,
            offer_id,
        }
    }

    pub fn to_prefix(self) -> OrderbookPrefix {
        KeyPrefix::from_key(self.to_bytes())
    }

    /// The sentinel key used to represent "no partial-exec offer" (e.g. a
    /// book that cleared fully) — the maximal key value.
    pub fn null_threshold() -> Self {
        OrderbookKey::from_bytes(OrderbookPrefix::max().bytes())
    }

    pub fn is_null_threshold(self) -> bool {
        self == Self::null_threshold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let k = OrderbookKey {
            price: Price::new(12345),
            owner: 77,
            offer_id: 999,
        };
        let bytes = k.to_bytes();
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 0);
        assert_eq!(OrderbookKey::from_bytes(&bytes), k);
    }

    #[test]
    fn sorts_by_price_then_owner_then_id() {
        let a = OrderbookKey {
            price: Price::new(1),
            owner: 5,
            offer_id: 1,
        };
        let b = OrderbookKey {
            price: Price::new(1),
            owner: 5,
            offer_id: 2,
        };
        let c = OrderbookKey {
            price: Price::new(2),
            owner: 1,
            offer_id: 1,
        };
        assert!(a < b);
        assert!(b < c);
        assert!(a.to_bytes() < b.to_bytes());
        assert!(b.to_bytes() < c.to_bytes());
    }
}
