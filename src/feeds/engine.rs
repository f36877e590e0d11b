/// Feed session internals: per-source buffers, eligibility and windows
///
/// Pure bookkeeping shared by the feed and replies engines. Fetching and
/// session management live in the owning stores; everything here operates
/// on already-buffered comments.
use crate::error::RecordedError;
use crate::feeds::FeedFilter;
use crate::models::{Comment, Page, SortType};
use crate::sorts;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Buffered state of one pagination source (one subplebbit, or one
/// comment's reply listing)
#[derive(Debug, Default)]
pub(crate) struct SourceBuffer {
    /// Sort whose chain is being followed after fallback
    pub resolved_sort: Option<SortType>,
    /// Last page loaded; its `next_cid` drives the chain
    pub tail: Option<Page>,
    /// Comments buffered from this source, in arrival order
    pub comments: Vec<Comment>,
    /// Head page has been loaded
    pub started: bool,
    /// Chain has no further pages
    pub exhausted: bool,
    /// Page cids the head was resolved against, for change detection
    pub known_page_cids: HashMap<SortType, String>,
    pub errors: Vec<RecordedError>,
}

impl SourceBuffer {
    /// Forget everything buffered and start the chain over; already
    /// delivered comments stay in the window untouched
    pub fn reset(&mut self) {
        *self = SourceBuffer::default();
    }

    /// Absorb one fetched page
    pub fn push_page(&mut self, page: Page) {
        self.started = true;
        self.exhausted = page.next_cid.is_none();
        self.comments.extend(page.comments.iter().cloned());
        self.tail = Some(page);
    }
}

/// The delivered portion of a feed; append-only
#[derive(Debug, Default)]
pub(crate) struct WindowState {
    pub window: Vec<Comment>,
    pub window_cids: HashSet<String>,
    /// Pages the consumer asked for
    pub pages_requested: usize,
    /// Pages actually appended to the window
    pub pages_delivered: usize,
}

impl WindowState {
    /// Append up to `limit` already-eligible comments to the window
    pub fn take(&mut self, eligible: Vec<Comment>, limit: usize) -> usize {
        let mut taken = 0;
        for comment in eligible.into_iter().take(limit) {
            if let Some(cid) = &comment.cid {
                self.window_cids.insert(cid.clone());
            }
            self.window.push(comment);
            taken += 1;
        }
        taken
    }
}

/// Per-account visibility rules applied to every buffered comment
pub(crate) struct Exclusions<'a> {
    pub blocked_addresses: &'a BTreeSet<String>,
    pub blocked_cids: &'a BTreeSet<String>,
    pub filter: Option<&'a FeedFilter>,
}

impl Exclusions<'_> {
    pub fn admits(&self, comment: &Comment) -> bool {
        if comment.is_hidden() {
            return false;
        }
        if self.blocked_addresses.contains(&comment.subplebbit_address)
            || self.blocked_addresses.contains(&comment.author.address)
        {
            return false;
        }
        if let Some(cid) = &comment.cid {
            if self.blocked_cids.contains(cid) {
                return false;
            }
        }
        if let Some(filter) = self.filter {
            if !filter.matches(comment) {
                return false;
            }
        }
        true
    }
}

/// Merge buffered sources into one eligible, sorted candidate list
///
/// Drops comments already delivered, duplicates across sources (first
/// occurrence wins), comments without a cid, and everything the
/// exclusions reject. The result is ordered by the session's sort.
pub(crate) fn merge_eligible<'a>(
    sort: SortType,
    buffers: impl Iterator<Item = &'a SourceBuffer>,
    exclusions: &Exclusions<'_>,
    window_cids: &HashSet<String>,
) -> Vec<Comment> {
    let mut seen = HashSet::new();
    let mut eligible = Vec::new();
    for buffer in buffers {
        for comment in &buffer.comments {
            let Some(cid) = &comment.cid else {
                continue;
            };
            if window_cids.contains(cid) || !seen.insert(cid.clone()) {
                continue;
            }
            if exclusions.admits(comment) {
                eligible.push(comment.clone());
            }
        }
    }
    eligible.sort_by(|a, b| sorts::compare(sort, a, b));
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(cid: &str, address: &str, timestamp: u64) -> Comment {
        Comment {
            cid: Some(cid.to_string()),
            subplebbit_address: address.to_string(),
            author: crate::models::Author {
                address: format!("{} author", cid),
                display_name: None,
            },
            timestamp,
            ..Default::default()
        }
    }

    fn buffer_with(comments: Vec<Comment>) -> SourceBuffer {
        SourceBuffer {
            comments,
            started: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_sorts_across_sources_and_dedups() {
        let a = buffer_with(vec![comment("a", "one.eth", 3), comment("dup", "one.eth", 9)]);
        let b = buffer_with(vec![comment("b", "two.eth", 5), comment("dup", "two.eth", 9)]);

        let blocked_addresses = BTreeSet::new();
        let blocked_cids = BTreeSet::new();
        let exclusions = Exclusions {
            blocked_addresses: &blocked_addresses,
            blocked_cids: &blocked_cids,
            filter: None,
        };

        let merged = merge_eligible(
            SortType::New,
            [&a, &b].into_iter(),
            &exclusions,
            &HashSet::new(),
        );
        let cids: Vec<&str> = merged.iter().map(|c| c.cid.as_deref().unwrap()).collect();
        assert_eq!(cids, vec!["dup", "b", "a"]);
    }

    #[test]
    fn test_exclusions_drop_blocked_and_hidden() {
        let mut removed = comment("removed", "one.eth", 8);
        removed.removed = Some(true);
        let buffer = buffer_with(vec![
            comment("ok", "one.eth", 1),
            comment("blocked cid", "one.eth", 2),
            comment("blocked sub", "bad.eth", 3),
            removed,
        ]);

        let blocked_addresses = BTreeSet::from(["bad.eth".to_string()]);
        let blocked_cids = BTreeSet::from(["blocked cid".to_string()]);
        let exclusions = Exclusions {
            blocked_addresses: &blocked_addresses,
            blocked_cids: &blocked_cids,
            filter: None,
        };

        let merged = merge_eligible(
            SortType::New,
            std::iter::once(&buffer),
            &exclusions,
            &HashSet::new(),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].cid.as_deref(), Some("ok"));
    }

    #[test]
    fn test_window_cids_never_reappear() {
        let buffer = buffer_with(vec![comment("a", "one.eth", 1), comment("b", "one.eth", 2)]);
        let blocked_addresses = BTreeSet::new();
        let blocked_cids = BTreeSet::new();
        let exclusions = Exclusions {
            blocked_addresses: &blocked_addresses,
            blocked_cids: &blocked_cids,
            filter: None,
        };

        let mut window = WindowState::default();
        let eligible = merge_eligible(
            SortType::New,
            std::iter::once(&buffer),
            &exclusions,
            &window.window_cids,
        );
        assert_eq!(window.take(eligible, 1), 1);
        assert_eq!(window.window[0].cid.as_deref(), Some("b"));

        let eligible = merge_eligible(
            SortType::New,
            std::iter::once(&buffer),
            &exclusions,
            &window.window_cids,
        );
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].cid.as_deref(), Some("a"));
    }

    #[test]
    fn test_source_reset_clears_buffer_state() {
        let mut buffer = buffer_with(vec![comment("a", "one.eth", 1)]);
        buffer.exhausted = true;
        buffer
            .known_page_cids
            .insert(SortType::New, "page cid 1".to_string());

        buffer.reset();
        assert!(!buffer.started);
        assert!(!buffer.exhausted);
        assert!(buffer.comments.is_empty());
        assert!(buffer.known_page_cids.is_empty());
    }

    #[test]
    fn test_push_page_tracks_chain_position() {
        let mut buffer = SourceBuffer::default();
        buffer.push_page(Page {
            comments: vec![comment("a", "one.eth", 1)],
            next_cid: Some("page cid 2".to_string()),
        });
        assert!(buffer.started);
        assert!(!buffer.exhausted);

        buffer.push_page(Page {
            comments: vec![comment("b", "one.eth", 2)],
            next_cid: None,
        });
        assert!(buffer.exhausted);
        assert_eq!(buffer.comments.len(), 2);
    }
}
