//! Candidate event grouping: two items link when their embeddings are close
//! AND their normalized titles share enough bigrams. Groups are the
//! connected components of that link graph.

use chrono::{DateTime, Utc};

use echoman_common::text::bigram_jaccard;

/// One item prepared for clustering.
#[derive(Debug, Clone)]
pub struct Clusterable {
    pub item_id: i64,
    pub normalized_title: String,
    pub fetched_at: DateTime<Utc>,
    pub embedding: Vec<f32>,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Build candidate groups as connected components over the pairwise link
/// relation. Each returned group holds indexes into `items`, ordered by
/// (fetched_at, item_id) so the first entry is the representative; groups
/// are ordered by their representative the same way.
pub fn build_candidate_groups(
    items: &[Clusterable],
    similarity_threshold: f64,
    jaccard_threshold: f64,
) -> Vec<Vec<usize>> {
    let n = items.len();
    let mut dsu = DisjointSet::new(n);

    for i in 0..n {
        for j in (i + 1)..n {
            let sim = cosine_similarity(&items[i].embedding, &items[j].embedding);
            if sim < similarity_threshold {
                continue;
            }
            let title_sim =
                bigram_jaccard(&items[i].normalized_title, &items[j].normalized_title);
            if title_sim >= jaccard_threshold {
                dsu.union(i, j);
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        groups[dsu.find(i)].push(i);
    }

    let mut groups: Vec<Vec<usize>> = groups.into_iter().filter(|g| !g.is_empty()).collect();
    let order_key = |&idx: &usize| (items[idx].fetched_at, items[idx].item_id);
    for group in &mut groups {
        group.sort_by_key(order_key);
    }
    groups.sort_by_key(|g| order_key(&g[0]));
    groups
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: i64, title: &str, minute: u32, embedding: Vec<f32>) -> Clusterable {
        Clusterable {
            item_id: id,
            normalized_title: echoman_common::text::normalize_title(title),
            fetched_at: Utc.with_ymd_and_hms(2025, 11, 7, 8, minute, 0).unwrap(),
            embedding,
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn cosine_of_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn similar_items_group_together() {
        let items = vec![
            item(1, "王传君获东京电影节影帝", 5, vec![1.0, 0.0]),
            item(2, "王传君获东京电影节影帝", 10, vec![0.99, 0.14]),
            item(3, "房贷利率下调", 7, vec![0.0, 1.0]),
        ];
        let groups = build_candidate_groups(&items, 0.80, 0.40);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![0, 1]);
        assert_eq!(groups[1], vec![2]);
    }

    #[test]
    fn vector_match_without_title_match_stays_apart() {
        // Same embedding direction, unrelated titles.
        let items = vec![
            item(1, "王传君获东京电影节影帝", 5, vec![1.0, 0.0]),
            item(2, "房贷利率再次下调", 6, vec![1.0, 0.0]),
        ];
        let groups = build_candidate_groups(&items, 0.80, 0.40);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn title_match_without_vector_match_stays_apart() {
        let items = vec![
            item(1, "王传君获东京电影节影帝", 5, vec![1.0, 0.0]),
            item(2, "王传君获东京电影节影帝", 6, vec![0.0, 1.0]),
        ];
        let groups = build_candidate_groups(&items, 0.80, 0.40);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn transitive_links_form_one_component() {
        // a~b and b~c but a and c are just under the threshold directly;
        // connected components still pull all three together.
        let a = vec![1.0, 0.0];
        let b = vec![0.924, 0.383]; // ~22.5° from both neighbours
        let c = vec![0.707, 0.707];
        let items = vec![
            item(1, "同一事件报道", 5, a),
            item(2, "同一事件报道", 6, b),
            item(3, "同一事件报道", 7, c),
        ];
        let groups = build_candidate_groups(&items, 0.90, 0.40);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn representative_is_earliest_fetch() {
        let items = vec![
            item(9, "热点事件标题", 30, vec![1.0, 0.0]),
            item(3, "热点事件标题", 5, vec![1.0, 0.0]),
        ];
        let groups = build_candidate_groups(&items, 0.80, 0.40);
        assert_eq!(groups.len(), 1);
        // Index 1 (item 3) fetched earlier, so it leads the group.
        assert_eq!(groups[0], vec![1, 0]);
    }

    #[test]
    fn fetch_tie_breaks_by_item_id() {
        let items = vec![
            item(9, "热点事件标题", 5, vec![1.0, 0.0]),
            item(3, "热点事件标题", 5, vec![1.0, 0.0]),
        ];
        let groups = build_candidate_groups(&items, 0.80, 0.40);
        assert_eq!(groups[0], vec![1, 0]);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(build_candidate_groups(&[], 0.80, 0.40).is_empty());
    }
}
