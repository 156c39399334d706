//! SHA-256 Merkle tree over ledger entry leaves.
//!
//! Leaves are hashed as `SHA256(0x00 || data)` and parents as
//! `SHA256(0x01 || lo || hi)` over the two children in sorted order, so a
//! proof is just the list of siblings from leaf to root. A lone node at the
//! end of a level moves up unchanged and contributes no sibling.

use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

pub fn hash_leaf(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(data);
    hasher.finalize().into()
}

fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update([NODE_TAG]);
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => hash_pair(a, b),
            [a] => *a,
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Root of `leaves`, or `None` for an empty set.
pub fn root(leaves: &[Hash]) -> Option<Hash> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    Some(level[0])
}

/// Siblings of `leaves[index]`, bottom to top.
pub fn proof(leaves: &[Hash], index: usize) -> Option<Vec<Hash>> {
    if index >= leaves.len() {
        return None;
    }
    let mut siblings = Vec::new();
    let mut level = leaves.to_vec();
    let mut i = index;
    while level.len() > 1 {
        let sibling = if i % 2 == 0 {
            level.get(i + 1).copied()
        } else {
            Some(level[i - 1])
        };
        siblings.extend(sibling);
        level = next_level(&level);
        i /= 2;
    }
    Some(siblings)
}

pub fn verify(root: &Hash, leaf: &Hash, proof: &[Hash]) -> bool {
    let computed = proof
        .iter()
        .fold(*leaf, |current, sibling| hash_pair(&current, sibling));
    computed == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash> {
        (0..n).map(|i| hash_leaf(&[i])).collect()
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(root(&[]), None);
        let one = leaves(1);
        assert_eq!(root(&one), Some(one[0]));
        assert_eq!(proof(&one, 0), Some(vec![]));
        assert!(verify(&one[0], &one[0], &[]));
    }

    #[test]
    fn test_odd_node_moves_up() {
        let l = leaves(3);
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &l[2]);
        assert_eq!(root(&l), Some(expected));
        assert_eq!(proof(&l, 2), Some(vec![hash_pair(&l[0], &l[1])]));
    }

    #[test]
    fn test_repeated_last_leaf_changes_root() {
        let l = leaves(3);
        let mut padded = l.clone();
        padded.push(l[2]);
        assert_ne!(root(&l), root(&padded));
    }

    #[test]
    fn test_interior_node_bytes_are_not_a_leaf() {
        let l = leaves(2);
        let r = root(&l).unwrap();
        let (lo, hi) = if l[0] <= l[1] { (l[0], l[1]) } else { (l[1], l[0]) };
        let spliced = [lo, hi].concat();
        assert!(!verify(&r, &hash_leaf(&spliced), &[]));
    }

    #[test]
    fn test_every_leaf_proves_inclusion() {
        for n in 1..=9 {
            let l = leaves(n);
            let r = root(&l).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let p = proof(&l, i).unwrap();
                assert!(verify(&r, leaf, &p), "leaf {} of {}", i, n);
            }
        }
    }

    #[test]
    fn test_foreign_leaf_fails() {
        let l = leaves(4);
        let r = root(&l).unwrap();
        let p = proof(&l, 1).unwrap();
        assert!(!verify(&r, &hash_leaf(b"forged"), &p));
        assert_eq!(proof(&l, 4), None);
    }
}
