use crate::config::NameMetric;

/// Similarity of two normalized names in `[0.0, 1.0]`.
///
/// A missing or blank name on either side scores `0.0`.
#[must_use]
pub fn name_similarity(left: Option<&str>, right: Option<&str>, metric: NameMetric) -> f64 {
    let (Some(left), Some(right)) = (clean(left), clean(right)) else {
        return 0.0;
    };

    match metric {
        NameMetric::Gestalt => gestalt_ratio(left, right),
        NameMetric::Levenshtein => strsim::normalized_levenshtein(left, right),
    }
}

fn clean(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Ratcliff/Obershelp: `2 * M / (|a| + |b|)` where `M` counts characters in
/// recursively found longest common blocks.
fn gestalt_ratio(left: &str, right: &str) -> f64 {
    let a: Vec<char> = left.chars().collect();
    let b: Vec<char> = right.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut matched = 0_usize;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_block(&a, &b, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        matched += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let ratio = (2 * matched) as f64 / total as f64;
    ratio
}

/// Longest common block of `a[alo..ahi]` and `b[blo..bhi]`. Ties keep the
/// block starting earliest in `a`, then earliest in `b`.
fn longest_block(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let mut best = (alo, blo, 0_usize);
    let mut previous = vec![0_usize; b.len() + 1];
    let mut current = vec![0_usize; b.len() + 1];

    for i in alo..ahi {
        for j in blo..bhi {
            current[j + 1] = if a[i] == b[j] { previous[j] + 1 } else { 0 };
            let size = current[j + 1];
            if size > best.2 {
                best = (i + 1 - size, j + 1 - size, size);
            }
        }
        std::mem::swap(&mut previous, &mut current);
        current.iter_mut().for_each(|slot| *slot = 0);
    }

    best
}
