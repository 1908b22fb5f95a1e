//! Offers and the (sell, buy) category they trade in.

use crate::price::Price;
use crate::trie::{EndowMetadata, HasEndow, TrieValue};

/// One (sell asset, buy asset) category. `asset_type` is always `Sell` in
/// the current protocol — the original reserves the field for a future
/// order type that never shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OfferCategory {
    pub sell_asset: u32,
    pub buy_asset: u32,
}

impl OfferCategory {
    pub fn new(sell_asset: u32, buy_asset: u32) -> Self {
        assert_ne!(sell_asset, buy_asset, "an asset cannot trade against itself");
        OfferCategory {
            sell_asset,
            buy_asset,
        }
    }

    /// Index into the flat `N*(N-1)` orderbook array: `sell*(N-1) + buy -
    /// [buy > sell]`.
    pub fn index(self, num_assets: u32) -> usize {
        let adjust = if self.buy_asset > self.sell_asset { 1 } else { 0 };
        (self.sell_asset * (num_assets - 1) + self.buy_asset - adjust) as usize
    }
}

/// A resting limit sell offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub owner: u64,
    pub offer_id: u64,
    pub category: OfferCategory,
    /// Amount of `sell_asset` offered. Must be `> 0` at rest — an offer
    /// that reaches amount zero is deleted, never persisted as a zero.
    pub amount: i64,
    pub min_price: Price,
}

impl Offer {
    pub fn endow(&self) -> i64 {
        self.amount
    }

    /// Inverse of [`TrieValue::serialize`], used when reloading offers
    /// persisted to a KV environment.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, crate::error::EngineError> {
        if bytes.len() < 8 + 8 + 4 + 4 + 8 + 8 {
            return Err(crate::error::EngineError::MetadataIntegrity {
                message: format!("offer record too short: {} bytes", bytes.len()),
            });
        }
        let owner = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let offer_id = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let sell_asset = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        let buy_asset = u32::from_be_bytes(bytes[20..24].try_into().unwrap());
        let amount = i64::from_be_bytes(bytes[24..32].try_into().unwrap());
        let min_price = u64::from_be_bytes(bytes[32..40].try_into().unwrap());
        Ok(Offer {
            owner,
            offer_id,
            category: OfferCategory::new(sell_asset, buy_asset),
            amount,
            min_price: Price(min_price),
        })
    }
}

impl HasEndow for Offer {
    fn endow(&self) -> i64 {
        self.amount
    }
}

impl TrieValue for Offer {
    type Extra = EndowMetadata;

    fn extra_metadata(&self) -> EndowMetadata {
        EndowMetadata { endow: self.amount }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.owner.to_be_bytes());
        out.extend_from_slice(&self.offer_id.to_be_bytes());
        out.extend_from_slice(&self.category.sell_asset.to_be_bytes());
        out.extend_from_slice(&self.category.buy_asset.to_be_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.min_price.0.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_index_matches_formula() {
        let num_assets = 5;
        let cat = OfferCategory::new(3, 1);
        assert_eq!(cat.index(num_assets), (3 * 4 + 1) as usize);
        let cat2 = OfferCategory::new(1, 3);
        assert_eq!(cat2.index(num_assets), (1 * 4 + 3 - 1) as usize);
    }
}
