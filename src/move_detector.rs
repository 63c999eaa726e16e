//! Pairs `deleted` and `created` changes by content similarity so a rename
//! is applied as a move, not a delete+create.

use crate::change_detector::{ChangeType, DetectedChange};

#[derive(Debug, Clone)]
pub struct MoveCandidate {
    pub from_path: String,
    pub to_path: String,
    pub similarity: f64,
    pub new_content: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct MoveConflict {
    pub to_path: String,
    pub candidates: Vec<String>,
}

pub struct MoveDetectionResult {
    pub moves: Vec<MoveCandidate>,
    pub conflicts: Vec<MoveConflict>,
    pub remaining: Vec<DetectedChange>,
}

const SMALL_FILE_THRESHOLD: usize = 4096;
const SAMPLE_WINDOW: usize = 1024;

/// `similarity(a, b) in [0, 1]`. Byte-identical content short-circuits to 1.0;
/// a large size delta short-circuits to 0.0; binary content never matches.
pub fn similarity(a: &[u8], b: &[u8]) -> f64 {
    if a == b {
        return 1.0;
    }
    let (la, lb) = (a.len(), b.len());
    if la == 0 && lb == 0 {
        return 1.0;
    }
    let max_len = la.max(lb) as f64;
    if max_len > 0.0 {
        let ratio = (la as f64 - lb as f64).abs() / max_len;
        if ratio > 0.5 {
            return 0.0;
        }
    }
    if std::str::from_utf8(a).is_err() || std::str::from_utf8(b).is_err() {
        return 0.0;
    }
    let sa = std::str::from_utf8(a).unwrap();
    let sb = std::str::from_utf8(b).unwrap();
    if sa.len() <= SMALL_FILE_THRESHOLD && sb.len() <= SMALL_FILE_THRESHOLD {
        return strsim::normalized_levenshtein(sa, sb);
    }
    let window = |s: &str, start: usize| -> &str {
        let end = (start + SAMPLE_WINDOW).min(s.len());
        let start = start.min(end);
        &s[start..end]
    };
    let mid_a = sa.len() / 2;
    let mid_b = sb.len() / 2;
    let samples = [
        (window(sa, 0), window(sb, 0)),
        (window(sa, mid_a.saturating_sub(SAMPLE_WINDOW / 2)), window(sb, mid_b.saturating_sub(SAMPLE_WINDOW / 2))),
        (
            window(sa, sa.len().saturating_sub(SAMPLE_WINDOW)),
            window(sb, sb.len().saturating_sub(SAMPLE_WINDOW)),
        ),
    ];
    let total: f64 = samples
        .iter()
        .map(|(x, y)| strsim::normalized_levenshtein(x, y))
        .sum();
    total / samples.len() as f64
}

pub fn detect_moves(changes: Vec<DetectedChange>, threshold: f64) -> MoveDetectionResult {
    let (mut deleted, mut rest): (Vec<_>, Vec<_>) = changes.into_iter().partition(|c| {
        c.change_type == ChangeType::LocalOnly && c.local_content.is_none() && !c.is_new
    });
    let (created, mut remaining): (Vec<_>, Vec<_>) = rest.drain(..).partition(|c| {
        c.change_type == ChangeType::LocalOnly && c.local_content.is_some() && c.is_new
    });

    let mut moves = Vec::new();
    let mut conflicts = Vec::new();
    let mut used_created: Vec<bool> = vec![false; created.len()];

    deleted.sort_by(|a, b| a.path.cmp(&b.path));
    for del in &deleted {
        let Some(del_content) = &del.previous_content else {
            continue;
        };
        let mut scored: Vec<(usize, f64)> = created
            .iter()
            .enumerate()
            .filter(|(i, _)| !used_created[*i])
            .filter_map(|(i, c)| {
                c.local_content
                    .as_ref()
                    .map(|content| (i, similarity(del_content, content)))
            })
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| {
            created[a.0].path.cmp(&created[b.0].path)
        }));

        match scored.len() {
            0 => {
                remaining.push(del.clone());
            }
            _ => {
                let (best_idx, best_score) = scored[0];
                if scored.iter().filter(|(_, s)| (*s - best_score).abs() < f64::EPSILON).count() > 1 {
                    conflicts.push(MoveConflict {
                        to_path: del.path.clone(),
                        candidates: scored.iter().map(|(i, _)| created[*i].path.clone()).collect(),
                    });
                    remaining.push(del.clone());
                } else {
                    used_created[best_idx] = true;
                    moves.push(MoveCandidate {
                        from_path: del.path.clone(),
                        to_path: created[best_idx].path.clone(),
                        similarity: best_score,
                        new_content: created[best_idx].local_content.clone(),
                    });
                }
            }
        }
    }

    for (i, c) in created.into_iter().enumerate() {
        if !used_created[i] {
            remaining.push(c);
        }
    }

    MoveDetectionResult {
        moves,
        conflicts,
        remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, is_new: bool, local: Option<Vec<u8>>, previous: Option<Vec<u8>>) -> DetectedChange {
        DetectedChange {
            path: path.to_string(),
            change_type: ChangeType::LocalOnly,
            is_new,
            local_content: local,
            previous_content: previous,
            remote_content: None,
            local_head: None,
            remote_head: None,
        }
    }

    #[test]
    fn identical_bytes_score_one() {
        assert_eq!(similarity(b"hello", b"hello"), 1.0);
    }

    #[test]
    fn large_size_delta_short_circuits_to_zero() {
        let a = vec![0u8; 10];
        let b = vec![0u8; 1000];
        assert_eq!(similarity(&a, &b), 0.0);
    }

    #[test]
    fn detects_a_simple_rename() {
        let changes = vec![
            change("original.txt", false, None, Some(b"the quick brown fox".to_vec())),
            change("renamed.txt", true, Some(b"the quick brown fox".to_vec()), None),
        ];
        let result = detect_moves(changes, 0.7);
        assert_eq!(result.moves.len(), 1);
        assert_eq!(result.moves[0].from_path, "original.txt");
        assert_eq!(result.moves[0].to_path, "renamed.txt");
        assert!(result.remaining.is_empty());
    }

    #[test]
    fn unrelated_delete_and_create_stay_unmatched() {
        let changes = vec![
            change("a.txt", false, None, Some(b"aaaaaaaaaaaaaaaaaaaa".to_vec())),
            change("b.txt", true, Some(b"zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz".to_vec()), None),
        ];
        let result = detect_moves(changes, 0.7);
        assert!(result.moves.is_empty());
        assert_eq!(result.remaining.len(), 2);
    }

    #[test]
    fn ambiguous_match_becomes_a_conflict() {
        let changes = vec![
            change("a.txt", false, None, Some(b"hello world".to_vec())),
            change("b.txt", true, Some(b"hello world".to_vec()), None),
            change("c.txt", true, Some(b"hello world".to_vec()), None),
        ];
        let result = detect_moves(changes, 0.5);
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.moves.is_empty());
    }
}
