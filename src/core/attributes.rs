//! State attribute bitset.
//!
//! Attributes are boolean flags that alter how the runtime treats a state:
//! where a controller starts, which states may be current, whether a state
//! can be left, and whether it records history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Set of attribute flags carried by a state node.
///
/// # Example
///
/// ```rust
/// use protostate::core::Attributes;
///
/// let attrs = Attributes::INITIAL | Attributes::MUTABLE;
/// assert!(attrs.contains(Attributes::INITIAL));
/// assert!(!attrs.contains(Attributes::FINAL));
///
/// let parsed: Attributes = "initial mutable".parse().unwrap();
/// assert_eq!(parsed, attrs);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Attributes(u16);

impl Attributes {
    /// No attributes.
    pub const NORMAL: Self = Self(0);
    /// Entered when the controller starts, or when its superstate is the
    /// starting point of the initial descent.
    pub const INITIAL: Self = Self(1 << 0);
    /// Chosen when an abstract superstate is targeted.
    pub const DEFAULT: Self = Self(1 << 1);
    /// Once current, cannot be departed.
    pub const FINAL: Self = Self(1 << 2);
    /// Can never be current; targeting it descends to a concrete substate.
    pub const ABSTRACT: Self = Self(1 << 3);
    /// Accepts no new substates.
    pub const SEALED: Self = Self(1 << 4);
    /// Once entered, transitions may not leave its subtree.
    pub const CONCLUSIVE: Self = Self(1 << 5);
    /// Allows `mutate()` on this state and its descendants.
    pub const MUTABLE: Self = Self(1 << 6);
    /// Records activations and interstitial mutations for replay.
    pub const HISTORY: Self = Self(1 << 7);
    /// Remembers the most recent active descendant and returns to it.
    pub const RETAINED: Self = Self(1 << 8);
    /// Limits history and retention to immediate substates.
    pub const SHALLOW: Self = Self(1 << 9);
    /// Content-free proxy for a state inherited from an ancestor owner.
    pub const VIRTUAL: Self = Self(1 << 10);

    const NAMED: [(Self, &'static str); 11] = [
        (Self::INITIAL, "initial"),
        (Self::DEFAULT, "default"),
        (Self::FINAL, "final"),
        (Self::ABSTRACT, "abstract"),
        (Self::SEALED, "sealed"),
        (Self::CONCLUSIVE, "conclusive"),
        (Self::MUTABLE, "mutable"),
        (Self::HISTORY, "history"),
        (Self::RETAINED, "retained"),
        (Self::SHALLOW, "shallow"),
        (Self::VIRTUAL, "virtual"),
    ];

    /// Raw bit representation.
    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Lowercase names of the flags that are set, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Attributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Attributes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Attributes(normal)");
        }
        write!(f, "Attributes({})", self.names().join(" | "))
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(" "))
    }
}

/// Error returned when parsing an unknown attribute keyword.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unknown state attribute '{0}'")]
pub struct UnknownAttribute(pub String);

impl FromStr for Attributes {
    type Err = UnknownAttribute;

    /// Parse a whitespace-separated list of attribute keywords.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut attributes = Self::NORMAL;
        for word in s.split_whitespace() {
            if word == "normal" {
                continue;
            }
            let flag = Self::NAMED
                .iter()
                .find(|(_, name)| *name == word)
                .map(|(flag, _)| *flag)
                .ok_or_else(|| UnknownAttribute(word.to_string()))?;
            attributes.insert(flag);
        }
        Ok(attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_contains() {
        let attrs = Attributes::ABSTRACT | Attributes::SEALED;
        assert!(attrs.contains(Attributes::ABSTRACT));
        assert!(attrs.contains(Attributes::SEALED));
        assert!(attrs.contains(Attributes::ABSTRACT | Attributes::SEALED));
        assert!(!attrs.contains(Attributes::ABSTRACT | Attributes::FINAL));
    }

    #[test]
    fn insert_and_remove() {
        let mut attrs = Attributes::NORMAL;
        attrs.insert(Attributes::VIRTUAL);
        assert!(attrs.contains(Attributes::VIRTUAL));
        attrs.remove(Attributes::VIRTUAL);
        assert!(attrs.is_empty());
    }

    #[test]
    fn parse_keywords() {
        let attrs: Attributes = "retained shallow".parse().unwrap();
        assert_eq!(attrs, Attributes::RETAINED | Attributes::SHALLOW);
        assert_eq!("normal".parse::<Attributes>().unwrap(), Attributes::NORMAL);
    }

    #[test]
    fn parse_rejects_unknown_keyword() {
        let err = "initial bogus".parse::<Attributes>().unwrap_err();
        assert_eq!(err, UnknownAttribute("bogus".to_string()));
    }

    #[test]
    fn display_lists_names_in_order() {
        let attrs = Attributes::HISTORY | Attributes::INITIAL;
        assert_eq!(attrs.to_string(), "initial history");
        assert_eq!(format!("{:?}", attrs), "Attributes(initial | history)");
    }

    #[test]
    fn difference_drops_flags() {
        let attrs = Attributes::INITIAL | Attributes::VIRTUAL;
        assert_eq!(attrs.difference(Attributes::VIRTUAL), Attributes::INITIAL);
    }
}
