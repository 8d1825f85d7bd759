//! Stratum merkle branches.
//!
//! Miners build the coinbase themselves (it contains their extranonce), so
//! the pool cannot send a merkle root. It sends the branch instead: the
//! sibling hashes on the path from the coinbase (leftmost leaf) to the root.
//!
//! ```text
//!             root
//!           /      \
//!        h01        h23        branch = [tx1, h23]
//!       /   \      /   \
//!     cb    tx1  tx2   tx3
//! ```

use bitcoin::hashes::{Hash, HashEngine, sha256d};

/// Hash two nodes into their parent.
fn join(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut engine = sha256d::Hash::engine();
    engine.input(left);
    engine.input(right);
    sha256d::Hash::from_engine(engine).to_byte_array()
}

/// Branch for a tree whose leaves are the coinbase followed by `txids`
/// (internal byte order).
pub fn merkle_branches(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branches = Vec::new();
    // Level without its leftmost node, which depends on the coinbase.
    let mut level: Vec<[u8; 32]> = txids.to_vec();

    while !level.is_empty() {
        branches.push(level[0]);

        // The leftmost pair (coinbase side, level[0]) is resolved by the
        // miner; pair up what remains. An odd node is paired with itself.
        let rest = &level[1..];
        level = rest
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => join(left, right),
                [single] => join(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }

    branches
}

/// Merkle root from a coinbase hash and its branch.
pub fn merkle_root(coinbase_hash: [u8; 32], branches: &[[u8; 32]]) -> [u8; 32] {
    branches
        .iter()
        .fold(coinbase_hash, |acc, branch| join(&acc, branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;
    use test_case::test_case;

    fn txid(seed: u8) -> Txid {
        Txid::from_raw_hash(sha256d::Hash::hash(&[seed]))
    }

    #[test_case(0; "coinbase only")]
    #[test_case(1; "one transaction")]
    #[test_case(2; "odd leaf count")]
    #[test_case(3; "full tree")]
    #[test_case(6; "odd inner level")]
    #[test_case(12; "larger block")]
    fn test_root_matches_full_tree(transactions: u8) {
        let coinbase = txid(0);
        let txids: Vec<Txid> = (1..=transactions).map(txid).collect();

        let expected = bitcoin::merkle_tree::calculate_root(
            std::iter::once(coinbase).chain(txids.iter().copied()),
        )
        .unwrap();

        let raw: Vec<[u8; 32]> = txids.iter().map(|t| t.to_byte_array()).collect();
        let branches = merkle_branches(&raw);
        let root = merkle_root(coinbase.to_byte_array(), &branches);

        assert_eq!(root, expected.to_byte_array());
    }

    #[test]
    fn test_branch_count() {
        let raw: Vec<[u8; 32]> = (1..=3).map(|i| txid(i).to_byte_array()).collect();
        assert_eq!(merkle_branches(&raw).len(), 2);
        assert!(merkle_branches(&[]).is_empty());
    }
}
