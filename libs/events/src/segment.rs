//! Segment helpers.
//!
//! Segments are `parent-child` strings such as
//! `technology & computing-software`. The parent is everything before the
//! first `-`.

/// Segment that untargeted ads are filed under.
pub const UNTARGETED: &str = "untargeted";

/// Returns the parent of a segment (the segment itself if it has no child).
pub fn parent_segment(segment: &str) -> &str {
    match segment.split_once('-') {
        Some((parent, _)) => parent,
        None => segment,
    }
}

/// Parent segments for a list, lowercased and deduplicated in first-seen order.
pub fn parent_segments(segments: &[String]) -> Vec<String> {
    let mut parents: Vec<String> = Vec::with_capacity(segments.len());
    for segment in segments {
        let parent = parent_segment(segment).to_ascii_lowercase();
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }
    parents
}

/// Lowercase segments for store queries.
pub fn normalize(segments: &[String]) -> Vec<String> {
    segments.iter().map(|s| s.to_ascii_lowercase()).collect()
}
