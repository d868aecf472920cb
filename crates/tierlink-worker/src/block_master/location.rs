use std::collections::HashMap;

use tierlink_proto::LocationBlockIdListEntry;

/// Merges entries sharing a `(tier_alias, medium_type)` location.
///
/// Block ids of duplicate locations are concatenated. Output entries keep
/// the order in which their location first appears.
pub fn merge_block_locations<I>(entries: I) -> Vec<LocationBlockIdListEntry>
where
    I: IntoIterator<Item = LocationBlockIdListEntry>,
{
    let mut merged: Vec<LocationBlockIdListEntry> = Vec::new();
    let mut index: HashMap<_, usize> = HashMap::new();

    for entry in entries {
        match index.get(&entry.location) {
            Some(&i) => merged[i].block_ids.extend(entry.block_ids),
            None => {
                index.insert(entry.location.clone(), merged.len());
                merged.push(entry);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierlink_proto::BlockStoreLocation;

    fn entry(tier: &str, medium: &str, ids: &[u64]) -> LocationBlockIdListEntry {
        LocationBlockIdListEntry {
            location: BlockStoreLocation::new(tier, medium),
            block_ids: ids.to_vec(),
        }
    }

    #[test]
    fn same_location_from_two_directories_is_merged() {
        // Two SSD directories, e.g. /mnt/ssd0 and /mnt/ssd1.
        let merged = merge_block_locations(vec![
            entry("SSD", "SSD", &[1, 2]),
            entry("SSD", "SSD", &[3]),
        ]);
        assert_eq!(merged, vec![entry("SSD", "SSD", &[1, 2, 3])]);
    }

    #[test]
    fn medium_type_is_part_of_the_key() {
        let merged = merge_block_locations(vec![
            entry("HDD", "HDD", &[1]),
            entry("HDD", "NVME", &[2]),
            entry("HDD", "HDD", &[3]),
        ]);
        assert_eq!(
            merged,
            vec![entry("HDD", "HDD", &[1, 3]), entry("HDD", "NVME", &[2])]
        );
    }

    #[test]
    fn no_two_entries_share_a_location() {
        let input: Vec<_> = (0..20u64)
            .map(|i| {
                let tier = ["MEM", "SSD", "HDD"][usize::try_from(i % 3).unwrap_or(0)];
                entry(tier, tier, &[i])
            })
            .collect();
        let merged = merge_block_locations(input);
        assert_eq!(merged.len(), 3);
        let total: usize = merged.iter().map(|e| e.block_ids.len()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn empty_input() {
        assert!(merge_block_locations(Vec::new()).is_empty());
    }
}
