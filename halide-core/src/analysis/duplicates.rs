//! Grouping primitives for duplicate detection.
//!
//! Exact grouping over checksums, perceptual grouping over hashes via
//! union-find, and deterministic primary selection. No persistence here.

use std::collections::HashMap;

use halide_model::{HashKind, ImageId, SimilarityType};

use crate::analysis::hashing::{self, HASH_BITS};
use crate::error::Result;

/// Projection of an image row carrying everything grouping needs.
#[derive(Debug, Clone)]
pub struct HashedImage {
    pub id: ImageId,
    pub checksum: String,
    pub dhash: Option<String>,
    pub ahash: Option<String>,
    pub whash: Option<String>,
    pub quality_score: Option<i32>,
    pub size_bytes: Option<i64>,
}

impl HashedImage {
    pub fn hash(&self, kind: HashKind) -> Option<&str> {
        match kind {
            HashKind::Dhash => self.dhash.as_deref(),
            HashKind::Ahash => self.ahash.as_deref(),
            HashKind::Whash => self.whash.as_deref(),
        }
    }
}

/// A grouping result before primary selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCandidate {
    pub image_ids: Vec<ImageId>,
    pub similarity_type: SimilarityType,
    pub confidence: i32,
}

/// Group images sharing an identical checksum. Only groups of two or more
/// are emitted; confidence is always 100.
pub fn group_by_exact(images: &[HashedImage]) -> Vec<GroupCandidate> {
    let mut by_checksum: HashMap<&str, Vec<ImageId>> = HashMap::new();
    for img in images {
        if !img.checksum.is_empty() {
            by_checksum
                .entry(img.checksum.as_str())
                .or_default()
                .push(img.id.clone());
        }
    }

    let mut groups: Vec<GroupCandidate> = by_checksum
        .into_values()
        .filter(|ids| ids.len() > 1)
        .map(|mut ids| {
            ids.sort();
            GroupCandidate {
                image_ids: ids,
                similarity_type: SimilarityType::Exact,
                confidence: 100,
            }
        })
        .collect();
    groups.sort_by(|a, b| a.image_ids.cmp(&b.image_ids));
    groups
}

/// Group images whose hashes of the given kind are within `threshold` bits
/// of each other, transitively. Confidence reflects the average pairwise
/// distance inside the component.
pub fn group_by_similarity(
    images: &[HashedImage],
    kind: HashKind,
    threshold: u32,
) -> Result<Vec<GroupCandidate>> {
    let mut ids: Vec<&ImageId> = Vec::new();
    let mut hashes: Vec<u64> = Vec::new();
    for img in images {
        if let Some(hex) = img.hash(kind) {
            ids.push(&img.id);
            hashes.push(hashing::parse_hex(hex)?);
        }
    }

    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut uf = UnionFind::new(ids.len());
    for i in 0..ids.len() {
        for j in (i + 1)..ids.len() {
            if hashing::hamming_distance(hashes[i], hashes[j]) <= threshold {
                uf.union(i, j);
            }
        }
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..ids.len() {
        components.entry(uf.find(i)).or_default().push(i);
    }

    let mut groups = Vec::new();
    for members in components.into_values() {
        if members.len() < 2 {
            continue;
        }

        let mut total_dist = 0u64;
        let mut comparisons = 0u64;
        for (a, &i) in members.iter().enumerate() {
            for &j in &members[(a + 1)..] {
                total_dist += u64::from(hashing::hamming_distance(hashes[i], hashes[j]));
                comparisons += 1;
            }
        }
        let avg_dist = if comparisons > 0 {
            total_dist as f64 / comparisons as f64
        } else {
            0.0
        };
        let confidence = (100.0 * (1.0 - avg_dist / f64::from(HASH_BITS))).round() as i32;

        let mut image_ids: Vec<ImageId> = members.iter().map(|&i| ids[i].clone()).collect();
        image_ids.sort();
        groups.push(GroupCandidate {
            image_ids,
            similarity_type: SimilarityType::Perceptual,
            confidence: confidence.clamp(0, 100),
        });
    }

    groups.sort_by(|a, b| a.image_ids.cmp(&b.image_ids));
    Ok(groups)
}

/// Pick the canonical representative of a group: the member with the
/// greatest `(quality_score or 0, size_bytes or 0, id)` tuple, so repeated
/// runs over unchanged inputs always choose the same primary.
pub fn select_primary(members: &[HashedImage]) -> Option<ImageId> {
    members
        .iter()
        .max_by(|a, b| {
            (a.quality_score.unwrap_or(0), a.size_bytes.unwrap_or(0), &a.id).cmp(&(
                b.quality_score.unwrap_or(0),
                b.size_bytes.unwrap_or(0),
                &b.id,
            ))
        })
        .map(|img| img.id.clone())
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, x: usize, y: usize) {
        let (px, py) = (self.find(x), self.find(y));
        if px != py {
            self.parent[px] = py;
        }
    }
}
