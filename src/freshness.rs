/// Centralized staleness policy
///
/// Every place that sees two representations of the same entity (the content
/// cache applying update events, the feed merge deduplicating a cid seen in
/// two pages, the replies updated view) decides which one wins through this
/// single comparator, so the policy cannot drift between call sites.
use crate::models::Comment;

/// Whether a snapshot carrying `candidate` freshness supersedes one carrying
/// `current` freshness.
///
/// A candidate with no `updated_at` never supersedes one that has it; before
/// any update has been observed (`current` is None), mere arrival counts as
/// newer. Equal timestamps are stale: re-applying the same update is a no-op.
pub fn is_newer(candidate: Option<u64>, current: Option<u64>) -> bool {
    match (candidate, current) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(c), Some(s)) => c > s,
    }
}

/// Read-time merge of two representations of the same comment: returns the
/// one with the larger `updated_at`.
///
/// Used when a cid is observed both through the cache and embedded inside a
/// fetched page. This is a read-time choice, not a write into either source.
pub fn fresher<'a>(a: &'a Comment, b: &'a Comment) -> &'a Comment {
    if is_newer(b.updated_at, a.updated_at) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_newer() {
        // first arrival always wins
        assert!(is_newer(None, None));
        assert!(is_newer(Some(1), None));
        // absent freshness never supersedes known freshness
        assert!(!is_newer(None, Some(1)));
        // strictly larger wins, equal is stale
        assert!(is_newer(Some(2), Some(1)));
        assert!(!is_newer(Some(1), Some(1)));
        assert!(!is_newer(Some(1), Some(2)));
    }

    #[test]
    fn test_fresher_prefers_larger_updated_at() {
        let mut a = Comment::default();
        a.updated_at = Some(10);
        a.upvote_count = Some(1);
        let mut b = Comment::default();
        b.updated_at = Some(20);
        b.upvote_count = Some(5);

        assert_eq!(fresher(&a, &b).upvote_count, Some(5));
        assert_eq!(fresher(&b, &a).upvote_count, Some(5));
        // ties keep the left (already-held) representation
        b.updated_at = Some(10);
        assert_eq!(fresher(&a, &b).upvote_count, Some(1));
    }
}
