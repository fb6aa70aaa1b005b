//! Line-based merge of two note bodies.

pub const LOCAL_MARKER: &str = "<<<<<<< LOCAL";
pub const SEPARATOR_MARKER: &str = "=======";
pub const REMOTE_MARKER: &str = ">>>>>>> REMOTE";

/// Merge two versions of a note body.
///
/// When one text contains the other the longer one wins. Otherwise the shared
/// leading and trailing lines are kept once and the diverging middle of each
/// side is wrapped in conflict markers.
pub fn merge_text(local: &str, remote: &str) -> String {
    if local.contains(remote) {
        return local.to_string();
    }
    if remote.contains(local) {
        return remote.to_string();
    }

    let local_lines: Vec<&str> = local.lines().collect();
    let remote_lines: Vec<&str> = remote.lines().collect();

    let prefix = local_lines
        .iter()
        .zip(&remote_lines)
        .take_while(|(l, r)| l == r)
        .count();
    let max_suffix = local_lines.len().min(remote_lines.len()) - prefix;
    let suffix = local_lines
        .iter()
        .rev()
        .zip(remote_lines.iter().rev())
        .take(max_suffix)
        .take_while(|(l, r)| l == r)
        .count();

    let mut merged: Vec<&str> = Vec::with_capacity(local_lines.len() + remote_lines.len() + 3);
    merged.extend(&local_lines[..prefix]);
    merged.push(LOCAL_MARKER);
    merged.extend(&local_lines[prefix..local_lines.len() - suffix]);
    merged.push(SEPARATOR_MARKER);
    merged.extend(&remote_lines[prefix..remote_lines.len() - suffix]);
    merged.push(REMOTE_MARKER);
    merged.extend(&local_lines[local_lines.len() - suffix..]);
    merged.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identical_texts_merge_to_themselves() {
        assert_eq!(merge_text("same", "same"), "same");
    }

    #[test]
    fn containing_text_wins() {
        assert_eq!(merge_text("draft", "draft plus more"), "draft plus more");
        assert_eq!(merge_text("a longer local body", "longer"), "a longer local body");
        assert_eq!(merge_text("", "remote"), "remote");
    }

    #[test]
    fn diverging_middle_is_marked() {
        let local = "title\nlocal line\nfooter";
        let remote = "title\nremote line\nfooter";
        let expected = "title\n<<<<<<< LOCAL\nlocal line\n=======\nremote line\n>>>>>>> REMOTE\nfooter";
        assert_eq!(merge_text(local, remote), expected);
    }

    #[test]
    fn no_common_lines() {
        let merged = merge_text("alpha", "beta");
        assert_eq!(merged, "<<<<<<< LOCAL\nalpha\n=======\nbeta\n>>>>>>> REMOTE");
    }

    #[test]
    fn prefix_and_suffix_do_not_overlap() {
        let local = "a\nb\na";
        let remote = "a\nc\nb\na";
        let merged = merge_text(local, remote);
        assert!(merged.starts_with("a\n"));
        assert!(merged.ends_with("\na"));
        assert!(merged.contains(LOCAL_MARKER));
        assert!(merged.contains(REMOTE_MARKER));
    }
}
