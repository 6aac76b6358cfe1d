// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Immutable hash-range partition table.
//!
//! A partition key is placed by hashing it with MD5 and reading the 16-byte
//! digest as a big-endian `u128`. Each shard owns an inclusive range of that
//! space. Lookups scan the table in ascending `start_key` order and return the
//! first shard whose range contains the hash, so overlapping ranges resolve
//! to the lowest-starting shard and gaps yield [`Error::NoShardForKey`].

use crate::error::{Error, Result};
use crate::proto::ShardDefinition;
use md5::{Digest, Md5};
use std::fmt;

/// Position of a partition key in the 128-bit hash space.
pub fn hash_key(partition_key: &str) -> u128 {
    let digest = Md5::digest(partition_key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    u128::from_be_bytes(bytes)
}

/// Decode a big-endian unsigned integer of arbitrary byte length.
fn decode_hash_key(shard_id: &str, bytes: &[u8]) -> Result<u128> {
    let first_significant = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let significant = &bytes[first_significant..];
    if significant.len() > 16 {
        return Err(Error::InvalidShardKey {
            shard_id: shard_id.to_string(),
            message: format!("{} significant bytes exceed 128 bits", significant.len()),
        });
    }
    Ok(significant
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
}

/// One shard and the inclusive hash range it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    shard_id: String,
    start_key: u128,
    end_key: u128,
}

impl ShardDescriptor {
    /// Create a descriptor for `[start_key, end_key]`.
    pub fn new(shard_id: impl Into<String>, start_key: u128, end_key: u128) -> Self {
        Self {
            shard_id: shard_id.into(),
            start_key,
            end_key,
        }
    }

    /// Decode a descriptor from its wire form.
    pub fn from_definition(definition: &ShardDefinition) -> Result<Self> {
        let shard_id = definition.shard_id.as_str();
        let start_key = decode_hash_key(shard_id, &definition.starting_hash_key)?;
        let end_key = decode_hash_key(shard_id, &definition.ending_hash_key)?;
        if start_key > end_key {
            return Err(Error::InvalidShardKey {
                shard_id: shard_id.to_string(),
                message: format!("start {start_key} is greater than end {end_key}"),
            });
        }
        Ok(Self::new(shard_id, start_key, end_key))
    }

    /// Shard identifier.
    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// First hash owned by this shard.
    pub fn start_key(&self) -> u128 {
        self.start_key
    }

    /// Last hash owned by this shard.
    pub fn end_key(&self) -> u128 {
        self.end_key
    }

    /// Whether the hash falls inside this shard's range.
    #[inline]
    pub fn contains(&self, hash: u128) -> bool {
        self.start_key <= hash && hash <= self.end_key
    }

    /// Whether the partition key hashes into this shard's range.
    pub fn belongs_to_shard(&self, partition_key: &str) -> bool {
        self.contains(hash_key(partition_key))
    }
}

/// A hole or an overlap between two neighbouring shards of a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageIssue {
    /// Hashes in `[start, end]` belong to no shard.
    Gap {
        /// First unowned hash.
        start: u128,
        /// Last unowned hash.
        end: u128,
    },
    /// Two shards claim the same hashes; `first` wins lookups.
    Overlap {
        /// Shard that owns the contested hashes.
        first: String,
        /// Shard that is shadowed.
        second: String,
    },
}

impl fmt::Display for CoverageIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageIssue::Gap { start, end } => {
                write!(f, "hashes {start:#x}..={end:#x} are not owned by any shard")
            }
            CoverageIssue::Overlap { first, second } => {
                write!(f, "shard {second} overlaps shard {first}")
            }
        }
    }
}

/// Sorted, immutable table of shard ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardMap {
    /// Sorted by `start_key`.
    shards: Vec<ShardDescriptor>,
}

impl ShardMap {
    /// Build a map from descriptors given in any order.
    pub fn new(mut shards: Vec<ShardDescriptor>) -> Self {
        // Stable, so equal starts keep their input order.
        shards.sort_by_key(|shard| shard.start_key);
        Self { shards }
    }

    /// Build a map from the control plane's shard definitions.
    pub fn from_definitions(definitions: &[ShardDefinition]) -> Result<Self> {
        let shards = definitions
            .iter()
            .map(ShardDescriptor::from_definition)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(shards))
    }

    /// Descriptors in ascending `start_key` order.
    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the map has no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Index of the first shard whose range contains `hash`.
    pub fn position_of_hash(&self, hash: u128) -> Option<usize> {
        self.shards.iter().position(|shard| shard.contains(hash))
    }

    /// Index and descriptor of the shard owning `partition_key`.
    pub fn find_shard(&self, partition_key: &str) -> Result<(usize, &ShardDescriptor)> {
        self.position_of_hash(hash_key(partition_key))
            .map(|index| (index, &self.shards[index]))
            .ok_or_else(|| Error::NoShardForKey {
                key: partition_key.to_string(),
            })
    }

    /// Report gaps and overlaps across the whole 128-bit space.
    pub fn coverage_issues(&self) -> Vec<CoverageIssue> {
        let mut issues = Vec::new();
        let Some(first) = self.shards.first() else {
            issues.push(CoverageIssue::Gap {
                start: 0,
                end: u128::MAX,
            });
            return issues;
        };

        if first.start_key > 0 {
            issues.push(CoverageIssue::Gap {
                start: 0,
                end: first.start_key - 1,
            });
        }

        // Track the furthest end seen so far and who owns it.
        let mut covered_to = first.end_key;
        let mut owner = first;
        for shard in &self.shards[1..] {
            if shard.start_key <= covered_to {
                issues.push(CoverageIssue::Overlap {
                    first: owner.shard_id.clone(),
                    second: shard.shard_id.clone(),
                });
            } else if shard.start_key > covered_to + 1 {
                issues.push(CoverageIssue::Gap {
                    start: covered_to + 1,
                    end: shard.start_key - 1,
                });
            }
            if shard.end_key > covered_to {
                covered_to = shard.end_key;
                owner = shard;
            }
        }

        if covered_to < u128::MAX {
            issues.push(CoverageIssue::Gap {
                start: covered_to + 1,
                end: u128::MAX,
            });
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str, start: &[u8], end: &[u8]) -> ShardDefinition {
        ShardDefinition {
            shard_id: id.to_string(),
            starting_hash_key: start.to_vec(),
            ending_hash_key: end.to_vec(),
        }
    }

    /// Find a key whose hash lands inside `[low, high]`.
    fn key_hashing_between(low: u128, high: u128) -> String {
        (0u64..)
            .map(|i| format!("key-{i}"))
            .find(|key| {
                let hash = hash_key(key);
                low <= hash && hash <= high
            })
            .unwrap()
    }

    #[test]
    fn test_map_sorted_from_any_order() {
        let map = ShardMap::from_definitions(&[
            definition("def", &[4, 5, 6], &[7, 8, 9]),
            definition("abc", &[3, 4, 5], &[6, 7, 8]),
        ])
        .unwrap();

        assert_eq!(
            map.shards(),
            &[
                ShardDescriptor::new("abc", 197_637, 395_016),
                ShardDescriptor::new("def", 263_430, 460_809),
            ]
        );
    }

    #[test]
    fn test_sorting_is_independent_of_input_order() {
        let shards = vec![
            ShardDescriptor::new("c", 300, 399),
            ShardDescriptor::new("a", 100, 199),
            ShardDescriptor::new("d", 400, 499),
            ShardDescriptor::new("b", 200, 299),
        ];
        let mut reversed = shards.clone();
        reversed.reverse();

        let map = ShardMap::new(shards);
        assert_eq!(map, ShardMap::new(reversed));
        let starts: Vec<u128> = map.shards().iter().map(|s| s.start_key()).collect();
        assert_eq!(starts, vec![100, 200, 300, 400]);
    }

    #[test]
    fn test_contains_inclusive_range() {
        let shard = ShardDescriptor::new("abc", 0x30405, 0x60708);
        assert!(shard.contains(0x32C45));
        assert!(!shard.contains(0x02000));
        assert!(shard.contains(0x30405));
        assert!(shard.contains(0x60708));
        assert!(!shard.contains(0x60709));
    }

    #[test]
    fn test_belongs_to_shard_uses_md5() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(hash_key(""), 0xd41d8cd98f00b204e9800998ecf8427e);

        let upper = ShardDescriptor::new("upper", 1u128 << 127, u128::MAX);
        let lower = ShardDescriptor::new("lower", 0, (1u128 << 127) - 1);
        assert!(upper.belongs_to_shard(""));
        assert!(!lower.belongs_to_shard(""));
    }

    #[test]
    fn test_equal_hashes_route_to_same_shard() {
        let map = ShardMap::new(vec![
            ShardDescriptor::new("a", 0, u128::MAX / 3),
            ShardDescriptor::new("b", u128::MAX / 3 + 1, u128::MAX / 3 * 2),
            ShardDescriptor::new("c", u128::MAX / 3 * 2 + 1, u128::MAX),
        ]);
        for i in 0..200 {
            let key = format!("{i:032x}");
            let (first, _) = map.find_shard(&key).unwrap();
            let (second, _) = map.find_shard(&key.clone()).unwrap();
            assert_eq!(first, second);
            assert_eq!(map.position_of_hash(hash_key(&key)), Some(first));
        }
    }

    #[test]
    fn test_gap_yields_no_shard() {
        let map = ShardMap::new(vec![ShardDescriptor::new("low", 0, u128::MAX / 2)]);
        let key = key_hashing_between(u128::MAX / 2 + 1, u128::MAX);
        assert!(matches!(
            map.find_shard(&key),
            Err(Error::NoShardForKey { key: k }) if k == key
        ));
    }

    #[test]
    fn test_overlap_first_match_wins() {
        let map = ShardMap::new(vec![
            ShardDescriptor::new("second", 1u128 << 126, u128::MAX),
            ShardDescriptor::new("first", 0, u128::MAX),
        ]);
        let key = key_hashing_between(1u128 << 126, u128::MAX);
        let (index, shard) = map.find_shard(&key).unwrap();
        assert_eq!(index, 0);
        assert_eq!(shard.shard_id(), "first");
    }

    #[test]
    fn test_decode_tolerates_leading_zeros() {
        let map = ShardMap::from_definitions(&[definition(
            "padded",
            &[0, 0, 0, 1],
            &[0xff; 16],
        )])
        .unwrap();
        assert_eq!(map.shards()[0].start_key(), 1);
        assert_eq!(map.shards()[0].end_key(), u128::MAX);

        let empty = ShardMap::from_definitions(&[definition("empty", &[], &[1])]).unwrap();
        assert_eq!(empty.shards()[0].start_key(), 0);
    }

    #[test]
    fn test_decode_rejects_oversized_and_inverted_keys() {
        let mut too_wide = vec![0u8; 1];
        too_wide.extend_from_slice(&[1u8; 17]);
        assert!(matches!(
            ShardMap::from_definitions(&[definition("wide", &[0], &too_wide)]),
            Err(Error::InvalidShardKey { .. })
        ));
        assert!(matches!(
            ShardMap::from_definitions(&[definition("inverted", &[9], &[1])]),
            Err(Error::InvalidShardKey { .. })
        ));
    }

    #[test]
    fn test_coverage_issues() {
        let contiguous = ShardMap::new(vec![
            ShardDescriptor::new("a", 0, (1u128 << 127) - 1),
            ShardDescriptor::new("b", 1u128 << 127, u128::MAX),
        ]);
        assert!(contiguous.coverage_issues().is_empty());

        let broken = ShardMap::new(vec![
            ShardDescriptor::new("a", 10, 100),
            ShardDescriptor::new("b", 50, 200),
            ShardDescriptor::new("c", 300, u128::MAX),
        ]);
        assert_eq!(
            broken.coverage_issues(),
            vec![
                CoverageIssue::Gap { start: 0, end: 9 },
                CoverageIssue::Overlap {
                    first: "a".into(),
                    second: "b".into()
                },
                CoverageIssue::Gap {
                    start: 201,
                    end: 299
                },
            ]
        );

        assert_eq!(
            ShardMap::default().coverage_issues(),
            vec![CoverageIssue::Gap {
                start: 0,
                end: u128::MAX
            }]
        );
    }
}
