//! Key → applier routing for one batch.
//!
//! The partition maps inclusive lower-bound keys to applier ids. A key is
//! owned by the greatest boundary not above it; keys below the lowest
//! boundary belong to the lowest range. A batch has exactly one partition
//! once routing started: re-installing is only allowed before the first
//! `route` call.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included, Unbounded};

use super::codec::display_key;
use super::error::LoaderError;
use super::types::{ApplierId, BatchId, Mutation, NodeId, RoutedBatch, Version, VersionedMutation};

/// Routing table for the active batch.
#[derive(Debug)]
pub struct ApplierRouter {
    batch_id: BatchId,
    ranges: BTreeMap<Vec<u8>, ApplierId>,
    finalized: bool,
}

/// Output of `ApplierRouter::route`: per applier, versions ascending, each
/// version's mutations in decode order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutedMutations {
    pub by_applier: BTreeMap<ApplierId, Vec<(Version, Vec<Mutation>)>>,
    pub mutation_count: u64,
}

impl ApplierRouter {
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            ranges: BTreeMap::new(),
            finalized: false,
        }
    }

    /// Install the batch partition.
    ///
    /// `boundaries[i]` is the inclusive lower bound of the range owned by
    /// `appliers[i]`; boundaries must strictly increase.
    pub fn install(
        &mut self,
        boundaries: Vec<Vec<u8>>,
        appliers: Vec<ApplierId>,
    ) -> Result<(), LoaderError> {
        if self.finalized {
            return Err(LoaderError::RoutingAlreadyFinalized {
                batch_id: self.batch_id,
            });
        }
        if boundaries.is_empty() {
            return Err(LoaderError::InvalidPartition {
                reason: "partition has no ranges".to_string(),
            });
        }
        if boundaries.len() != appliers.len() {
            return Err(LoaderError::InvalidPartition {
                reason: format!(
                    "{} boundaries but {} appliers",
                    boundaries.len(),
                    appliers.len()
                ),
            });
        }
        if let Some(pair) = boundaries.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(LoaderError::InvalidPartition {
                reason: format!(
                    "boundaries not strictly increasing at {}",
                    display_key(&pair[1])
                ),
            });
        }

        self.ranges = boundaries.into_iter().zip(appliers).collect();
        tracing::debug!(
            batch_id = self.batch_id,
            ranges = self.ranges.len(),
            "installed applier partition"
        );
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Applier owning `key`. `None` only when no partition is installed.
    pub fn resolve(&self, key: &[u8]) -> Option<ApplierId> {
        self.ranges
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .or_else(|| self.ranges.iter().next())
            .map(|(_, applier)| *applier)
    }

    /// Distinct appliers holding at least one range.
    pub fn list_assigned_appliers(&self) -> BTreeSet<ApplierId> {
        self.ranges.values().copied().collect()
    }

    pub fn ranges(&self) -> impl Iterator<Item = (&[u8], ApplierId)> {
        self.ranges.iter().map(|(key, applier)| (key.as_slice(), *applier))
    }

    /// Group mutations by owning applier and version.
    ///
    /// Range clears spanning several ranges are split at the boundaries so
    /// each applier only sees the part it owns. Routing finalizes the
    /// partition for the rest of the batch.
    pub fn route(
        &mut self,
        mutations: Vec<VersionedMutation>,
    ) -> Result<RoutedMutations, LoaderError> {
        if !self.is_installed() {
            return Err(LoaderError::NoPartition {
                batch_id: self.batch_id,
            });
        }
        self.finalized = true;

        let mut grouped: BTreeMap<ApplierId, BTreeMap<Version, Vec<Mutation>>> = BTreeMap::new();
        let mut count = 0u64;
        for VersionedMutation { version, mutation } in mutations {
            if mutation.is_range() {
                for (applier, piece) in self.split_range(&mutation) {
                    grouped
                        .entry(applier)
                        .or_default()
                        .entry(version)
                        .or_default()
                        .push(piece);
                    count += 1;
                }
                continue;
            }
            let Some(applier) = self.resolve(&mutation.key) else {
                continue;
            };
            grouped
                .entry(applier)
                .or_default()
                .entry(version)
                .or_default()
                .push(mutation);
            count += 1;
        }

        Ok(RoutedMutations {
            by_applier: grouped
                .into_iter()
                .map(|(applier, versions)| (applier, versions.into_iter().collect()))
                .collect(),
            mutation_count: count,
        })
    }

    fn split_range(&self, mutation: &Mutation) -> Vec<(ApplierId, Mutation)> {
        let (begin, end) = (mutation.key.as_slice(), mutation.param.as_slice());
        let mut pieces: Vec<(ApplierId, Mutation)> = Vec::new();
        if begin >= end {
            if let Some(owner) = self.resolve(begin) {
                pieces.push((owner, mutation.clone()));
            }
            return pieces;
        }

        let mut start = begin.to_vec();
        let cuts = self
            .ranges
            .range::<[u8], _>((Excluded(begin), Excluded(end)))
            .map(|(boundary, _)| boundary.clone())
            .collect::<Vec<_>>();
        for cut in cuts.into_iter().chain(std::iter::once(end.to_vec())) {
            let Some(owner) = self.resolve(&start) else {
                break;
            };
            match pieces.last_mut() {
                // Adjacent ranges of the same applier stay one clear.
                Some((last_owner, last)) if *last_owner == owner => last.param = cut.clone(),
                _ => pieces.push((owner, Mutation::clear_range(start.clone(), cut.clone()))),
            }
            start = cut;
        }
        pieces
    }

    /// Log the boundary → applier mapping.
    pub fn describe(&self) {
        for (key, applier) in &self.ranges {
            tracing::debug!(
                batch_id = self.batch_id,
                start = %display_key(key),
                applier,
                "applier range"
            );
        }
    }
}

impl RoutedMutations {
    /// Cut each applier's mutations into messages of roughly `max_bytes`.
    ///
    /// A version group may span messages; message order preserves version and
    /// decode order, so an applier that consumes its messages sequentially
    /// sees mutations in the routed order.
    pub fn into_batches(
        self,
        node_id: NodeId,
        batch_id: BatchId,
        file: &str,
        max_bytes: usize,
    ) -> BTreeMap<ApplierId, Vec<RoutedBatch>> {
        let max_bytes = max_bytes.max(1);
        let mut out = BTreeMap::new();
        for (applier, versions) in self.by_applier {
            let mut batches = Vec::new();
            let mut entries: Vec<(Version, Vec<Mutation>)> = Vec::new();
            let mut bytes = 0usize;
            for (version, mutations) in versions {
                for mutation in mutations {
                    let weight = mutation.weight() + 8;
                    if bytes > 0 && bytes + weight > max_bytes {
                        batches.push(RoutedBatch {
                            node_id,
                            batch_id,
                            applier,
                            file: file.to_string(),
                            entries: std::mem::take(&mut entries),
                        });
                        bytes = 0;
                    }
                    match entries.last_mut() {
                        Some((last_version, group)) if *last_version == version => {
                            group.push(mutation)
                        }
                        _ => entries.push((version, vec![mutation])),
                    }
                    bytes += weight;
                }
            }
            if !entries.is_empty() {
                batches.push(RoutedBatch {
                    node_id,
                    batch_id,
                    applier,
                    file: file.to_string(),
                    entries,
                });
            }
            out.insert(applier, batches);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPLIER_A: ApplierId = 0xA;
    const APPLIER_B: ApplierId = 0xB;

    fn two_appliers() -> ApplierRouter {
        let mut router = ApplierRouter::new(1);
        router
            .install(
                vec![b"key0".to_vec(), b"key50".to_vec()],
                vec![APPLIER_A, APPLIER_B],
            )
            .expect("install");
        router
    }

    #[test]
    fn resolves_by_inclusive_lower_bound() {
        let router = two_appliers();
        assert_eq!(router.resolve(b"key30"), Some(APPLIER_A));
        assert_eq!(router.resolve(b"key75"), Some(APPLIER_B));
        assert_eq!(router.resolve(b"key0"), Some(APPLIER_A));
        assert_eq!(router.resolve(b"key50"), Some(APPLIER_B));
    }

    #[test]
    fn keys_below_first_boundary_go_to_first_range() {
        let router = two_appliers();
        assert_eq!(router.resolve(b""), Some(APPLIER_A));
        assert_eq!(router.resolve(b"a"), Some(APPLIER_A));
    }

    #[test]
    fn resolve_is_stable_for_a_partition() {
        let router = two_appliers();
        for key in [b"k".as_slice(), b"key49", b"key5", b"zzz"] {
            assert_eq!(router.resolve(key), router.resolve(key));
            assert!(router.resolve(key).is_some());
        }
    }

    #[test]
    fn resolve_without_partition_is_none() {
        let router = ApplierRouter::new(1);
        assert_eq!(router.resolve(b"x"), None);
    }

    #[test]
    fn lists_distinct_appliers() {
        let mut router = ApplierRouter::new(1);
        router
            .install(
                vec![b"".to_vec(), b"g".to_vec(), b"p".to_vec()],
                vec![1, 2, 1],
            )
            .expect("install");
        assert_eq!(router.list_assigned_appliers(), BTreeSet::from([1, 2]));
    }

    #[test]
    fn rejects_invalid_partitions() {
        let mut router = ApplierRouter::new(1);
        assert!(router.install(vec![], vec![]).is_err());
        assert!(router.install(vec![b"a".to_vec()], vec![1, 2]).is_err());
        assert!(router
            .install(vec![b"b".to_vec(), b"a".to_vec()], vec![1, 2])
            .is_err());
        assert!(router
            .install(vec![b"a".to_vec(), b"a".to_vec()], vec![1, 2])
            .is_err());
        assert!(!router.is_installed());
    }

    #[test]
    fn reinstall_is_rejected_after_routing() {
        let mut router = two_appliers();
        router
            .install(vec![b"".to_vec()], vec![APPLIER_B])
            .expect("reinstall before routing");
        router
            .route(vec![VersionedMutation::new(1, Mutation::set(b"a".to_vec(), b"1".to_vec()))])
            .expect("route");
        let err = router
            .install(vec![b"".to_vec()], vec![APPLIER_A])
            .expect_err("partition is final");
        assert_eq!(err, LoaderError::RoutingAlreadyFinalized { batch_id: 1 });
    }

    #[test]
    fn route_groups_by_applier_and_version_in_decode_order() {
        let mut router = two_appliers();
        let muts = vec![
            VersionedMutation::new(7, Mutation::set(b"key10".to_vec(), b"1".to_vec())),
            VersionedMutation::new(5, Mutation::set(b"key60".to_vec(), b"2".to_vec())),
            VersionedMutation::new(7, Mutation::clear(b"key20".to_vec())),
            VersionedMutation::new(5, Mutation::set(b"key11".to_vec(), b"3".to_vec())),
        ];
        let routed = router.route(muts).expect("route");
        assert_eq!(routed.mutation_count, 4);
        assert_eq!(
            routed.by_applier[&APPLIER_A],
            vec![
                (5, vec![Mutation::set(b"key11".to_vec(), b"3".to_vec())]),
                (
                    7,
                    vec![
                        Mutation::set(b"key10".to_vec(), b"1".to_vec()),
                        Mutation::clear(b"key20".to_vec())
                    ]
                ),
            ]
        );
        assert_eq!(
            routed.by_applier[&APPLIER_B],
            vec![(5, vec![Mutation::set(b"key60".to_vec(), b"2".to_vec())])]
        );
    }

    #[test]
    fn clear_range_is_split_at_boundaries() {
        let mut router = ApplierRouter::new(1);
        router
            .install(
                vec![b"".to_vec(), b"g".to_vec(), b"m".to_vec(), b"t".to_vec()],
                vec![1, 2, 2, 3],
            )
            .expect("install");
        let routed = router
            .route(vec![VersionedMutation::new(
                9,
                Mutation::clear_range(b"c".to_vec(), b"w".to_vec()),
            )])
            .expect("route");
        assert_eq!(routed.by_applier[&1], vec![(9, vec![Mutation::clear_range(b"c".to_vec(), b"g".to_vec())])]);
        assert_eq!(routed.by_applier[&2], vec![(9, vec![Mutation::clear_range(b"g".to_vec(), b"t".to_vec())])]);
        assert_eq!(routed.by_applier[&3], vec![(9, vec![Mutation::clear_range(b"t".to_vec(), b"w".to_vec())])]);
    }

    #[test]
    fn route_without_partition_fails() {
        let mut router = ApplierRouter::new(3);
        let err = router.route(Vec::new()).expect_err("no partition");
        assert_eq!(err, LoaderError::NoPartition { batch_id: 3 });
    }

    #[test]
    fn batches_respect_byte_cap_and_order() {
        let mut router = two_appliers();
        let muts: Vec<VersionedMutation> = (0..10)
            .map(|i| VersionedMutation::new(100 + i / 4, Mutation::set(format!("key1{i}").into_bytes(), vec![0; 20])))
            .collect();
        let routed = router.route(muts.clone()).expect("route");
        let batches = routed.into_batches(1, 1, "f", 100);
        let a = &batches[&APPLIER_A];
        assert!(a.len() > 1);
        let flattened: Vec<VersionedMutation> = a
            .iter()
            .flat_map(|b| {
                b.entries
                    .iter()
                    .flat_map(|(v, ms)| ms.iter().map(move |m| VersionedMutation::new(*v, m.clone())))
            })
            .collect();
        assert_eq!(flattened, muts);
    }
}
