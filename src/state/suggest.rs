//! Suggested buckets for a clarification prompt

use std::collections::BTreeMap;

/// How many buckets are highlighted for the user
pub const MAX_SUGGESTIONS: usize = 2;

/// Pick up to two buckets to highlight.
///
/// An explicit score map wins and is ranked descending. Without one, the
/// backend's own pick comes first, followed by known bucket names in the
/// order they appear in the question text.
pub fn suggest_buckets(
    known: &[String],
    primary: Option<&str>,
    question: Option<&str>,
    scores: Option<&BTreeMap<String, f64>>,
) -> Vec<String> {
    if let Some(scores) = scores.filter(|s| !s.is_empty()) {
        let mut ranked: Vec<(&String, &f64)> = scores.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(a.1));
        return ranked
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(bucket, _)| bucket.clone())
            .collect();
    }

    let mut suggested: Vec<String> = Vec::with_capacity(MAX_SUGGESTIONS);
    if let Some(primary) = primary.filter(|p| !p.is_empty()) {
        suggested.push(primary.to_string());
    }

    if let Some(question) = question {
        let haystack = question.to_lowercase();
        let mut mentioned: Vec<(usize, &String)> = known
            .iter()
            .filter_map(|bucket| haystack.find(&bucket.to_lowercase()).map(|at| (at, bucket)))
            .collect();
        mentioned.sort_by_key(|(at, _)| *at);

        for (_, bucket) in mentioned {
            if !suggested.iter().any(|s| s.eq_ignore_ascii_case(bucket)) {
                suggested.push(bucket.clone());
            }
        }
    }

    suggested.truncate(MAX_SUGGESTIONS);
    suggested
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<String> {
        ["People", "Projects", "Ideas", "Admin"]
            .iter()
            .map(|b| b.to_string())
            .collect()
    }

    #[test]
    fn test_scores_ranked_descending() {
        let scores: BTreeMap<String, f64> = [("Admin", 0.2), ("Ideas", 0.45), ("People", 0.3)]
            .into_iter()
            .map(|(b, s)| (b.to_string(), s))
            .collect();
        assert_eq!(
            suggest_buckets(&known(), Some("Admin"), None, Some(&scores)),
            vec!["Ideas", "People"]
        );
    }

    #[test]
    fn test_question_scan_in_source_order() {
        assert_eq!(
            suggest_buckets(&known(), None, Some("Is this an admin task or one of your Projects?"), None),
            vec!["Admin", "Projects"]
        );
    }

    #[test]
    fn test_primary_first_without_duplicates() {
        assert_eq!(
            suggest_buckets(&known(), Some("Ideas"), Some("Ideas or People?"), None),
            vec!["Ideas", "People"]
        );
    }

    #[test]
    fn test_nothing_known() {
        assert!(suggest_buckets(&known(), None, Some("What do you mean?"), None).is_empty());
        assert_eq!(suggest_buckets(&known(), Some("Admin"), None, None), vec!["Admin"]);
    }
}
