//! Grouping oracles and partition normalisation.
//!
//! A [`GroupingOracle`] receives one vector per item at a level and
//! returns a [`Partition`]: lists of item indices. Oracles may be sloppy
//! (overlapping groups, missing items, out-of-range indices); the builder
//! runs every result through [`normalize_partition`] before use.
//!
//! Two oracles ship with the crate:
//!
//! - [`SequentialOracle`] groups contiguous windows in document order.
//! - [`KMeansOracle`] runs Lloyd's algorithm under cosine similarity with
//!   deterministic farthest-point seeding.

use anyhow::Result;

use crate::embedding::{cosine_similarity, normalize};

/// Groups of item indices (positions in the vector slice).
pub type Partition = Vec<Vec<usize>>;

/// Sizing hint passed to the oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingHint {
    /// Preferred upper bound on items per group.
    pub max_group_size: Option<usize>,
    /// Explicit group count, if the caller wants one.
    pub target_groups: Option<usize>,
}

impl GroupingHint {
    /// Group count for `n` items: explicit target, else `ceil(n / max)`,
    /// else `ceil(sqrt(n))`. Always within `1..=n` for `n > 0`.
    pub fn group_count(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let k = match (self.target_groups, self.max_group_size) {
            (Some(k), _) => k,
            (None, Some(max)) => n.div_ceil(max.max(1)),
            (None, None) => (n as f64).sqrt().ceil() as usize,
        };
        k.clamp(1, n)
    }
}

/// Partitions a set of vectors into groups.
pub trait GroupingOracle: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Partition `vectors`. Errors are treated as grouping failures; an
    /// empty or identity partition is not an error.
    fn partition(&self, vectors: &[Vec<f32>], hint: &GroupingHint) -> Result<Partition>;
}

/// Why a normalised partition cannot be used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degenerate {
    /// No group survived normalisation.
    Empty,
    /// One group per item: the level would not shrink.
    Identity,
}

/// Clean up an oracle partition over `n` items.
///
/// Out-of-range indices are dropped, an item claimed by several groups
/// stays in the first one, unclaimed items form one trailing group, empty
/// groups are removed, members are sorted and groups are ordered by their
/// earliest member. Every item in `0..n` appears exactly once in the result.
pub fn normalize_partition(raw: Partition, n: usize) -> std::result::Result<Partition, Degenerate> {
    let mut claimed = vec![false; n];
    let mut groups: Partition = Vec::with_capacity(raw.len() + 1);

    for group in raw {
        let mut kept = Vec::with_capacity(group.len());
        for i in group {
            if i < n && !claimed[i] {
                claimed[i] = true;
                kept.push(i);
            }
        }
        if !kept.is_empty() {
            kept.sort_unstable();
            groups.push(kept);
        }
    }

    let unassigned: Vec<usize> = (0..n).filter(|i| !claimed[*i]).collect();
    if !unassigned.is_empty() && !groups.is_empty() {
        groups.push(unassigned);
    } else if !unassigned.is_empty() {
        return Err(Degenerate::Empty);
    }

    if groups.is_empty() {
        return Err(Degenerate::Empty);
    }
    groups.sort_by_key(|g| g[0]);
    if n > 1 && groups.len() == n {
        return Err(Degenerate::Identity);
    }
    Ok(groups)
}

/// Contiguous windows of `max_group_size` items in input order.
#[derive(Debug, Clone, Default)]
pub struct SequentialOracle;

impl GroupingOracle for SequentialOracle {
    fn name(&self) -> &str {
        "sequential"
    }

    fn partition(&self, vectors: &[Vec<f32>], hint: &GroupingHint) -> Result<Partition> {
        let n = vectors.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let size = n.div_ceil(hint.group_count(n));
        Ok((0..n)
            .collect::<Vec<_>>()
            .chunks(size)
            .map(|c| c.to_vec())
            .collect())
    }
}

/// Lloyd's k-means under cosine similarity.
#[derive(Debug, Clone)]
pub struct KMeansOracle {
    max_iterations: usize,
}

impl KMeansOracle {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    /// First centroid is item 0; each next one is the item farthest from
    /// every chosen centroid (ties go to the lowest index).
    fn seed(&self, data: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
        let mut chosen = vec![0usize];
        let mut nearest: Vec<f32> = data
            .iter()
            .map(|v| 1.0 - cosine_similarity(v, &data[0]))
            .collect();
        while chosen.len() < k {
            let mut best = None;
            for (i, d) in nearest.iter().enumerate() {
                if chosen.contains(&i) {
                    continue;
                }
                match best {
                    Some((_, bd)) if *d <= bd => {}
                    _ => best = Some((i, *d)),
                }
            }
            let Some((next, _)) = best else { break };
            chosen.push(next);
            for (i, v) in data.iter().enumerate() {
                let d = 1.0 - cosine_similarity(v, &data[next]);
                if d < nearest[i] {
                    nearest[i] = d;
                }
            }
        }
        chosen.into_iter().map(|i| data[i].clone()).collect()
    }
}

impl Default for KMeansOracle {
    fn default() -> Self {
        Self::new(25)
    }
}

fn closest(v: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_sim = f32::MIN;
    for (c, centroid) in centroids.iter().enumerate() {
        let sim = cosine_similarity(v, centroid);
        if sim > best_sim {
            best_sim = sim;
            best = c;
        }
    }
    best
}

impl GroupingOracle for KMeansOracle {
    fn name(&self) -> &str {
        "kmeans"
    }

    fn partition(&self, vectors: &[Vec<f32>], hint: &GroupingHint) -> Result<Partition> {
        let n = vectors.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let dims = vectors[0].len();
        if let Some(bad) = vectors.iter().position(|v| v.len() != dims) {
            anyhow::bail!(
                "vector {} has {} dims, expected {}",
                bad,
                vectors[bad].len(),
                dims
            );
        }

        let data: Vec<Vec<f32>> = vectors
            .iter()
            .map(|v| {
                let mut v = v.clone();
                normalize(&mut v);
                v
            })
            .collect();
        let k = hint.group_count(n);
        let mut centroids = self.seed(&data, k);
        let mut assignment = vec![usize::MAX; n];

        for iteration in 0..self.max_iterations {
            let mut changed = false;
            for (i, v) in data.iter().enumerate() {
                let c = closest(v, &centroids);
                if assignment[i] != c {
                    assignment[i] = c;
                    changed = true;
                }
            }
            if !changed {
                tracing::trace!(iteration, "k-means converged");
                break;
            }
            for (c, centroid) in centroids.iter_mut().enumerate() {
                let mut sum = vec![0.0f32; dims];
                let mut members = 0;
                for (i, v) in data.iter().enumerate() {
                    if assignment[i] == c {
                        members += 1;
                        for (s, x) in sum.iter_mut().zip(v) {
                            *s += x;
                        }
                    }
                }
                if members > 0 {
                    normalize(&mut sum);
                    *centroid = sum;
                }
            }
        }

        let mut groups: Partition = vec![Vec::new(); centroids.len()];
        for (i, c) in assignment.into_iter().enumerate() {
            groups[c].push(i);
        }
        groups.retain(|g| !g.is_empty());
        groups.sort_by_key(|g| g[0]);
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_repairs_sloppy_partitions() {
        let raw = vec![vec![3, 1, 9], vec![1, 2], vec![], vec![0]];
        let groups = normalize_partition(raw, 6).unwrap();
        assert_eq!(groups, vec![vec![0], vec![1, 3], vec![2], vec![4, 5]]);
    }

    #[test]
    fn degenerate_partitions_detected() {
        assert_eq!(normalize_partition(vec![], 4), Err(Degenerate::Empty));
        assert_eq!(normalize_partition(vec![vec![7, 8]], 4), Err(Degenerate::Empty));
        assert_eq!(
            normalize_partition(vec![vec![0], vec![1], vec![2]], 3),
            Err(Degenerate::Identity)
        );
        assert_eq!(normalize_partition(vec![vec![0]], 1), Ok(vec![vec![0]]));
    }

    #[test]
    fn group_count_rules() {
        let hint = GroupingHint::default();
        assert_eq!(hint.group_count(10), 4);
        let hint = GroupingHint {
            max_group_size: Some(3),
            target_groups: None,
        };
        assert_eq!(hint.group_count(10), 4);
        let hint = GroupingHint {
            max_group_size: Some(3),
            target_groups: Some(50),
        };
        assert_eq!(hint.group_count(10), 10);
    }

    #[test]
    fn sequential_windows_preserve_order() {
        let vectors = vec![vec![0.0]; 7];
        let hint = GroupingHint {
            max_group_size: Some(3),
            target_groups: None,
        };
        let p = SequentialOracle.partition(&vectors, &hint).unwrap();
        assert_eq!(p, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn kmeans_separates_clusters() {
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.95, 0.05, 0.0],
            vec![0.05, 0.95, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.1, 0.9, 0.0],
        ];
        let hint = GroupingHint {
            max_group_size: None,
            target_groups: Some(2),
        };
        let p = KMeansOracle::default().partition(&vectors, &hint).unwrap();
        assert_eq!(p, vec![vec![0, 2, 4], vec![1, 3, 5]]);
    }

    #[test]
    fn kmeans_is_deterministic() {
        let vectors: Vec<Vec<f32>> = (0..20)
            .map(|i| vec![(i as f32).sin(), (i as f32).cos(), (i % 3) as f32])
            .collect();
        let hint = GroupingHint::default();
        let a = KMeansOracle::default().partition(&vectors, &hint).unwrap();
        let b = KMeansOracle::default().partition(&vectors, &hint).unwrap();
        assert_eq!(a, b);
        assert!(normalize_partition(a, 20).is_ok());
    }

    #[test]
    fn kmeans_rejects_ragged_vectors() {
        let vectors = vec![vec![1.0, 0.0], vec![1.0]];
        assert!(KMeansOracle::default()
            .partition(&vectors, &GroupingHint::default())
            .is_err());
    }
}
