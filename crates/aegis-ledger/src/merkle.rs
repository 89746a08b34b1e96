//! BLAKE3 Merkle trees over contiguous ranges of entry self-hashes.

use aegis_crypto::{hash_fields, Digest};
use serde::{Deserialize, Serialize};

/// One step of an inclusion path: the sibling hash and which side it sits on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleStep {
    pub sibling: Digest,
    pub sibling_is_left: bool,
}

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    hash_fields(&[left, right])
}

/// Compute the Merkle root of a non-empty list of leaf hashes. Odd levels
/// promote the last node unchanged.
pub fn merkle_root(leaves: &[Digest]) -> Option<Digest> {
    if leaves.is_empty() {
        return None;
    }
    let mut level: Vec<Digest> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => *single,
                _ => unreachable!("chunks(2) yields 1 or 2 elements"),
            })
            .collect();
    }
    Some(level[0])
}

/// Inclusion path for the leaf at `index`.
pub fn merkle_path(leaves: &[Digest], index: usize) -> Option<Vec<MerkleStep>> {
    if index >= leaves.len() {
        return None;
    }
    let mut path = Vec::new();
    let mut level: Vec<Digest> = leaves.to_vec();
    let mut idx = index;
    while level.len() > 1 {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        if sibling_idx < level.len() {
            path.push(MerkleStep {
                sibling: level[sibling_idx],
                sibling_is_left: sibling_idx < idx,
            });
        }
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => *single,
                _ => unreachable!("chunks(2) yields 1 or 2 elements"),
            })
            .collect();
        idx /= 2;
    }
    Some(path)
}

/// Replay an inclusion path from a leaf up to an expected root.
pub fn verify_path(leaf: &Digest, path: &[MerkleStep], root: &Digest) -> bool {
    let mut acc = *leaf;
    for step in path {
        acc = if step.sibling_is_left {
            hash_pair(&step.sibling, &acc)
        } else {
            hash_pair(&acc, &step.sibling)
        };
    }
    &acc == root
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_crypto::hash_bytes;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n).map(|i| hash_bytes(&[i as u8])).collect()
    }

    #[test]
    fn empty_has_no_root() {
        assert!(merkle_root(&[]).is_none());
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l), Some(l[0]));
    }

    #[test]
    fn root_changes_with_any_leaf() {
        let l = leaves(5);
        let root = merkle_root(&l).unwrap();
        let mut tampered = l.clone();
        tampered[3] = hash_bytes(b"tampered");
        assert_ne!(merkle_root(&tampered).unwrap(), root);
    }

    proptest! {
        #[test]
        fn property_every_leaf_has_a_verifying_path(n in 1usize..40, pick in 0usize..40) {
            let l = leaves(n);
            let idx = pick % n;
            let root = merkle_root(&l).unwrap();
            let path = merkle_path(&l, idx).unwrap();
            prop_assert!(verify_path(&l[idx], &path, &root));

            // A different leaf must not verify against the same path/root
            // unless it is the identical hash.
            let other = hash_bytes(b"not-a-leaf");
            prop_assert!(!verify_path(&other, &path, &root));
        }
    }
}
