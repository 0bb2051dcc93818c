//! Flow tags: `key` or `key:value`
//!
//! Keys compare case-insensitively. A value only has to match when both the
//! flow tag and the requested tag carry one; otherwise the key alone decides.

/// Split a tag on its first `:`. A leading `:` is not a separator, so
/// `":foo"` is the key `":foo"` without a value.
pub fn split_tag(tag: &str) -> (&str, Option<&str>) {
    match tag.find(':') {
        Some(pos) if pos > 0 => (&tag[..pos], Some(&tag[pos + 1..])),
        _ => (tag, None),
    }
}

/// Key of a tag, lower-cased
pub fn tag_key(tag: &str) -> String {
    split_tag(tag).0.to_lowercase()
}

/// Does the flow tag `have` satisfy the requested tag `want`?
pub fn tag_matches(have: &str, want: &str) -> bool {
    let (have_key, have_value) = split_tag(have);
    let (want_key, want_value) = split_tag(want);
    if !have_key.eq_ignore_ascii_case(want_key) {
        return false;
    }
    match (have_value, want_value) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

fn has_tag<S: AsRef<str>>(flow_tags: &[S], want: &str) -> bool {
    flow_tags.iter().any(|have| tag_matches(have.as_ref(), want))
}

/// Every requested tag is present. An empty request matches everything.
pub fn has_all_tags<S: AsRef<str>, W: AsRef<str>>(flow_tags: &[S], wanted: &[W]) -> bool {
    wanted.iter().all(|want| has_tag(flow_tags, want.as_ref()))
}

/// At least one requested tag is present. An empty request matches
/// everything.
pub fn has_at_least_one_tag<S: AsRef<str>, W: AsRef<str>>(flow_tags: &[S], wanted: &[W]) -> bool {
    wanted.is_empty() || wanted.iter().any(|want| has_tag(flow_tags, want.as_ref()))
}

/// Every group has at least one member present: the outer list is a
/// conjunction, each inner list a disjunction.
pub fn has_at_least_one_tag_per_group<S: AsRef<str>, W: AsRef<str>>(
    flow_tags: &[S],
    groups: &[Vec<W>],
) -> bool {
    groups
        .iter()
        .all(|group| has_at_least_one_tag(flow_tags, group))
}
