/// Sort comparators and page-chain fallback policy
///
/// The feed engine consumes comparators opaquely: every sort maps to a
/// total order over comments, best-first. Ranks tie-break by timestamp and
/// finally by cid so merges are deterministic across runs.
use crate::models::{Comment, Pages, SortType};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Epoch used by the hot rank's age decay
const HOT_EPOCH_SECS: f64 = 1_134_028_003.0;

/// Log-scaled score with age decay
fn hot_rank(comment: &Comment) -> f64 {
    let score = comment.score() as f64;
    let order = score.abs().max(1.0).log10();
    let sign = if score > 0.0 {
        1.0
    } else if score < 0.0 {
        -1.0
    } else {
        0.0
    };
    let seconds = comment.timestamp as f64 - HOT_EPOCH_SECS;
    sign * order + seconds / 45_000.0
}

/// Magnitude-times-balance controversy score; zero unless both sides voted
fn controversy_rank(comment: &Comment) -> f64 {
    let ups = comment.upvote_count.unwrap_or(0) as f64;
    let downs = comment.downvote_count.unwrap_or(0) as f64;
    if ups <= 0.0 || downs <= 0.0 {
        return 0.0;
    }
    let magnitude = ups + downs;
    let balance = if ups > downs { downs / ups } else { ups / downs };
    magnitude.powf(balance)
}

/// Latest known activity in the comment's tree
fn active_rank(comment: &Comment) -> u64 {
    comment
        .last_reply_timestamp
        .unwrap_or(0)
        .max(comment.timestamp)
}

fn by_rank_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn tie_break(a: &Comment, b: &Comment) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| a.cid.cmp(&b.cid))
}

/// Total order for `sort`: `Less` means `a` appears before `b` in the feed
pub fn compare(sort: SortType, a: &Comment, b: &Comment) -> Ordering {
    let primary = match sort {
        SortType::New | SortType::NewFlat => b.timestamp.cmp(&a.timestamp),
        SortType::Old | SortType::OldFlat => a.timestamp.cmp(&b.timestamp),
        SortType::TopAll | SortType::Best => b.score().cmp(&a.score()),
        SortType::Active => active_rank(b).cmp(&active_rank(a)),
        SortType::Hot => by_rank_desc(hot_rank(a), hot_rank(b)),
        SortType::ControversialAll => by_rank_desc(controversy_rank(a), controversy_rank(b)),
    };
    primary.then_with(|| tie_break(a, b))
}

/// Page-pointer fallback chain for a requested sort
///
/// A flattened variant falls back to its nested equivalent and vice versa;
/// top falls back to best; everything else degrades toward top/best or new.
/// Totality is completed at resolution time: when the whole chain misses,
/// the first sort in declaration order with any page data is used.
pub fn fallback_chain(sort: SortType) -> &'static [SortType] {
    match sort {
        SortType::Hot => &[SortType::Hot, SortType::TopAll, SortType::Best],
        SortType::New => &[SortType::New, SortType::NewFlat],
        SortType::Old => &[SortType::Old, SortType::OldFlat],
        SortType::Active => &[SortType::Active, SortType::New],
        SortType::TopAll => &[SortType::TopAll, SortType::Best],
        SortType::ControversialAll => &[
            SortType::ControversialAll,
            SortType::TopAll,
            SortType::Best,
        ],
        SortType::Best => &[SortType::Best, SortType::TopAll],
        SortType::NewFlat => &[SortType::NewFlat, SortType::New],
        SortType::OldFlat => &[SortType::OldFlat, SortType::Old],
    }
}

/// Resolve the sort whose page data will actually be read
///
/// Walks the fallback chain against the sorts that have any page data
/// (preloaded page or page cid); falls back to the first populated sort in
/// declaration order so the result is total whenever any data exists.
pub fn resolve_sort(pages: &Pages, requested: SortType) -> Option<SortType> {
    let has_data =
        |sort: &SortType| pages.pages.contains_key(sort) || pages.page_cids.contains_key(sort);

    fallback_chain(requested)
        .iter()
        .find(|sort| has_data(sort))
        .copied()
        .or_else(|| SortType::ALL.into_iter().find(|sort| has_data(sort)))
}

/// Recursively inline a nested reply tree into one flat sequence
///
/// Walks every preloaded page across sort variants, deduplicating by cid.
/// The caller re-sorts the result with the flat sort's comparator.
pub fn flatten_replies(comments: &[Comment]) -> Vec<Comment> {
    let mut seen = HashSet::new();
    let mut flat = Vec::new();
    collect_replies(comments, &mut seen, &mut flat);
    flat
}

/// Flatten every reply reachable from a `Pages` listing across sort variants
pub fn flatten_reply_pages(pages: &Pages) -> Vec<Comment> {
    let mut seen = HashSet::new();
    let mut flat = Vec::new();
    for page in pages.pages.values() {
        collect_replies(&page.comments, &mut seen, &mut flat);
    }
    flat
}

fn collect_replies(comments: &[Comment], seen: &mut HashSet<String>, out: &mut Vec<Comment>) {
    for comment in comments {
        if let Some(cid) = &comment.cid {
            if !seen.insert(cid.clone()) {
                continue;
            }
        }
        out.push(comment.clone());
        for page in comment.replies.pages.values() {
            collect_replies(&page.comments, seen, out);
        }
    }
}
