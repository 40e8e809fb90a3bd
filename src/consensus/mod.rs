//! Consensus core: federated-server rosters, the per-minute VM ownership
//! rotation, and the per-height process lists.

pub mod process_list;
pub mod vm;

use crate::utilities::crypto::PublicKey;
use crate::utilities::hash::Hash;

/// Hard cap on parallel VM logs per height; only `|fed_servers|` are live.
pub const MAX_VMS: usize = 32;

/// A server permitted to issue acks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedServer {
    pub chain_id: Hash,
    pub public_key: PublicKey,
}

/// A passive replica eligible for promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditServer {
    pub chain_id: Hash,
    pub public_key: PublicKey,
}

/// Rosters are kept sorted by chain id so every node derives the same
/// server indices.
pub fn sort_federated(servers: &mut [FederatedServer]) {
    servers.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
}

pub fn sort_audit(servers: &mut [AuditServer]) {
    servers.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
}

/// The per-minute VM ownership rotation, a pure function of the height and
/// the federated-server count. Row `minute` column `vm` holds the index of
/// the owning server.
pub fn build_server_map(dbheight: u32, server_count: usize) -> Vec<Vec<usize>> {
    let n = server_count.max(1);
    let mut rows = Vec::with_capacity(10);
    let mut ix = (dbheight as usize).wrapping_mul(131) % n;
    for _minute in 0..10 {
        ix = (ix + 1) % n;
        let mut row = Vec::with_capacity(n);
        for _vm in 0..n {
            row.push(ix);
            ix = (ix + 1) % n;
        }
        rows.push(row);
    }
    rows
}

/// Routes a message-keyed operation to a VM by summing the hash bytes.
pub fn vm_index_for(hash: &Hash, server_count: usize) -> usize {
    let n = server_count.max(1);
    let sum: u64 = hash.as_bytes().iter().map(|b| u64::from(*b)).sum();
    (sum % n as u64) as usize
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utilities::hash::sha256;

    #[test]
    fn test_server_map_rows_are_permutations() {
        for height in [0u32, 1, 5, 100, 131, 99999] {
            for n in 1..=8usize {
                let map = build_server_map(height, n);
                assert_eq!(map.len(), 10);
                for row in &map {
                    assert_eq!(row.len(), n);
                    let mut seen = vec![false; n];
                    for &owner in row {
                        assert!(owner < n);
                        assert!(!seen[owner], "owner {owner} repeats in a minute row");
                        seen[owner] = true;
                    }
                }
            }
        }
    }

    #[test]
    fn test_server_map_rotates_between_minutes() {
        let map = build_server_map(5, 2);
        // Two servers swap ownership of VM 0 between consecutive minutes.
        assert_ne!(map[0][0], map[1][0]);
    }

    #[test]
    fn test_every_server_owns_every_vm_across_minutes() {
        for n in 1..=6usize {
            let map = build_server_map(3, n);
            for vm in 0..n {
                let mut owners: Vec<usize> = map.iter().map(|row| row[vm]).collect();
                owners.sort_unstable();
                owners.dedup();
                assert_eq!(owners.len(), n, "vm {vm} not covered by all {n} servers");
            }
        }
    }

    #[test]
    fn test_server_map_is_deterministic() {
        assert_eq!(build_server_map(42, 5), build_server_map(42, 5));
        assert_ne!(build_server_map(42, 5), build_server_map(43, 5));
    }

    #[test]
    fn test_vm_index_for_in_range() {
        for n in 1..=8usize {
            for i in 0..20u8 {
                assert!(vm_index_for(&sha256(&[i]), n) < n);
            }
        }
    }
}
