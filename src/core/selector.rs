//! Selector grammar for addressing states.
//!
//! - `""` is the root, `"."` is the querying state itself
//! - `"A.B"` is absolute: `B` inside `A` inside the root
//! - a leading `.` makes the path relative: `".A"` is a substate of the
//!   querying state
//! - every further empty segment steps to the superstate: `".."` is the
//!   superstate, `"..B"` a sibling named `B`
//! - `*` matches any immediate substate, `**` any descendant
//!
//! Parsing is total; matching works purely on name paths so it applies
//! equally to real, virtual and not-yet-materialized states.

/// One step of a parsed selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Step to the superstate.
    Up,
    /// A substate by name.
    Name(String),
    /// Any immediate substate (`*`).
    Any,
    /// Any descendant, one or more levels down (`**`).
    Descendants,
}

/// A parsed selector expression.
///
/// # Example
///
/// ```rust
/// use protostate::core::Selector;
///
/// let sel = Selector::parse("..B");
/// assert!(sel.is_relative());
///
/// let here = vec!["A".to_string()];
/// let sibling = vec!["B".to_string()];
/// assert!(sel.matches(&here, &sibling));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    relative: bool,
    segments: Vec<Segment>,
    raw: String,
}

impl Selector {
    pub fn parse(expr: &str) -> Self {
        let raw = expr.to_string();
        if expr.is_empty() {
            return Self {
                relative: false,
                segments: Vec::new(),
                raw,
            };
        }

        let mut tokens: Vec<&str> = expr.split('.').collect();
        let relative = tokens.first() == Some(&"");
        if relative {
            tokens.remove(0);
        }
        // A trailing dot leaves an empty token that is not a step.
        if tokens.last() == Some(&"") {
            tokens.pop();
        }

        let segments = tokens
            .into_iter()
            .map(|token| match token {
                "" => Segment::Up,
                "*" => Segment::Any,
                "**" => Segment::Descendants,
                name => Segment::Name(name.to_string()),
            })
            .collect();

        Self {
            relative,
            segments,
            raw,
        }
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// A bare `*` or `**`, which guard and transition keys treat as
    /// matching every state.
    pub fn is_universal(&self) -> bool {
        self.raw == "*" || self.raw == "**"
    }

    /// True if the selector contains no wildcard, so it names at most one
    /// state.
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Up | Segment::Name(_)))
    }

    /// Check whether `candidate` (a path from root) is selected when the
    /// selector is evaluated from `context` (also a path from root).
    pub fn matches(&self, context: &[String], candidate: &[String]) -> bool {
        let base: Vec<String> = if self.relative {
            context.to_vec()
        } else {
            Vec::new()
        };
        walk(&self.segments, base, candidate)
    }
}

impl From<&str> for Selector {
    fn from(expr: &str) -> Self {
        Self::parse(expr)
    }
}

fn is_prefix(prefix: &[String], path: &[String]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path).all(|(a, b)| a == b)
}

fn walk(segments: &[Segment], mut cursor: Vec<String>, candidate: &[String]) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        return cursor.as_slice() == candidate;
    };

    match head {
        Segment::Name(name) => {
            cursor.push(name.clone());
            walk(rest, cursor, candidate)
        }
        Segment::Up => {
            if cursor.pop().is_none() {
                return false;
            }
            walk(rest, cursor, candidate)
        }
        Segment::Any => {
            if !is_prefix(&cursor, candidate) || cursor.len() == candidate.len() {
                return false;
            }
            cursor.push(candidate[cursor.len()].clone());
            walk(rest, cursor, candidate)
        }
        Segment::Descendants => {
            if !is_prefix(&cursor, candidate) {
                return false;
            }
            (cursor.len() + 1..=candidate.len())
                .any(|depth| walk(rest, candidate[..depth].to_vec(), candidate))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(expr: &str) -> Vec<String> {
        if expr.is_empty() {
            Vec::new()
        } else {
            expr.split('.').map(str::to_string).collect()
        }
    }

    #[test]
    fn empty_selector_is_root() {
        let sel = Selector::parse("");
        assert!(!sel.is_relative());
        assert!(sel.segments().is_empty());
        assert!(sel.matches(&path("A"), &path("")));
    }

    #[test]
    fn dot_is_self_and_double_dot_is_superstate() {
        assert!(Selector::parse(".").matches(&path("A.B"), &path("A.B")));
        assert!(Selector::parse("..").matches(&path("A.B"), &path("A")));
        assert!(Selector::parse("...").matches(&path("A.B"), &path("")));
    }

    #[test]
    fn relative_and_sibling_paths() {
        assert!(Selector::parse(".C").matches(&path("A.B"), &path("A.B.C")));
        assert!(Selector::parse("..C").matches(&path("A.B"), &path("A.C")));
        assert!(!Selector::parse("..C").matches(&path("A.B"), &path("C")));
    }

    #[test]
    fn absolute_paths_ignore_context() {
        let sel = Selector::parse("A.B");
        assert!(sel.matches(&path("X.Y"), &path("A.B")));
        assert!(!sel.matches(&path("A"), &path("A.A.B")));
    }

    #[test]
    fn interior_up_step() {
        assert!(Selector::parse("A..B").matches(&[], &path("B")));
    }

    #[test]
    fn up_past_root_matches_nothing() {
        assert!(!Selector::parse("..").matches(&[], &path("")));
    }

    #[test]
    fn single_wildcard_matches_immediate_substates() {
        let sel = Selector::parse("B.*");
        assert!(sel.matches(&[], &path("B.BA")));
        assert!(!sel.matches(&[], &path("B")));
        assert!(!sel.matches(&[], &path("B.BA.X")));
    }

    #[test]
    fn double_wildcard_matches_any_descendant() {
        let sel = Selector::parse("B.**");
        assert!(sel.matches(&[], &path("B.BA")));
        assert!(sel.matches(&[], &path("B.BA.X")));
        assert!(!sel.matches(&[], &path("B")));
        assert!(!sel.matches(&[], &path("A.X")));
    }

    #[test]
    fn wildcard_followed_by_name() {
        let sel = Selector::parse("*.X");
        assert!(sel.matches(&[], &path("A.X")));
        assert!(!sel.matches(&[], &path("A.Y")));
        assert!(Selector::parse("**.X").matches(&[], &path("A.B.X")));
    }

    #[test]
    fn universal_and_exact_flags() {
        assert!(Selector::parse("*").is_universal());
        assert!(Selector::parse("**").is_universal());
        assert!(!Selector::parse("A.*").is_universal());
        assert!(Selector::parse("..A.B").is_exact());
        assert!(!Selector::parse("A.*").is_exact());
    }

    #[test]
    fn trailing_dot_is_not_a_step() {
        assert_eq!(Selector::parse("A.").segments(), &[Segment::Name("A".into())]);
    }
}
