//! Concurrent Merkle-Patricia trie (§4.1): the storage primitive shared by
//! the orderbook (§4.2), the account modification log (§4.4), and the
//! block-header hash map (§4.6).

pub mod merkle_trie;
pub mod metadata;
pub mod node;
pub mod prefix;
pub mod recycling;

pub use merkle_trie::{Blake2b256, MerkleTrie};
pub use metadata::{EndowMetadata, ExtraMetadata, HasEndow, TrieMetadata};
pub use node::{Hash, TrieValue};
pub use prefix::{AccountPrefix, KeyPrefix, OrderbookPrefix, ACCOUNT_KEY_BYTES, ORDERBOOK_KEY_BYTES};
