//! # Restriction
//!
//! Module dedicated to restrictions: the predicate trees stored in
//! search criteria and evaluated against message rows. A
//! restriction can contain sub-restrictions, which are evaluated
//! against sub-objects of a message (recipients, attachments) rather
//! than the message itself.

mod evaluator;

use std::{cmp::Ordering, collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::store::Row;

#[doc(inline)]
pub use self::evaluator::{PropertyEvaluator, RestrictionEvaluator, SubRestrictionResults};

/// A property tag.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropTag(pub u32);

impl PropTag {
    pub const IMPORTANCE: Self = Self(0x0017_0003);
    pub const SUBJECT: Self = Self(0x0037_001F);
    pub const SENDER_NAME: Self = Self(0x0C1A_001F);
    pub const DISPLAY_TO: Self = Self(0x0E04_001F);
    pub const MESSAGE_DELIVERY_TIME: Self = Self(0x0E06_0040);
    pub const MESSAGE_FLAGS: Self = Self(0x0E07_0003);
    pub const BODY: Self = Self(0x1000_001F);
    pub const DISPLAY_NAME: Self = Self(0x3001_001F);
    pub const EMAIL_ADDRESS: Self = Self(0x3003_001F);
    pub const CONTENT_COUNT: Self = Self(0x3602_0003);
    pub const CONTENT_UNREAD: Self = Self(0x3603_0003);
    pub const ATTACH_LONG_FILENAME: Self = Self(0x3707_001F);
}

impl fmt::Display for PropTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "value")]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    String(String),
    /// A timestamp, in seconds since epoch.
    Time(i64),
}

impl PropValue {
    /// Compare two values of the same type.
    ///
    /// Values of different types are not comparable.
    pub fn compare(&self, other: &PropValue) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
            _ => None,
        }
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for PropValue {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// The relational operator of a property restriction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Relop {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Relop {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Self::Lt => ord.is_lt(),
            Self::Le => ord.is_le(),
            Self::Gt => ord.is_gt(),
            Self::Ge => ord.is_ge(),
            Self::Eq => ord.is_eq(),
            Self::Ne => ord.is_ne(),
        }
    }
}

/// How the value of a content restriction is matched.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FuzzyMatch {
    FullString,
    #[default]
    Substring,
    Prefix,
}

/// The fuzzy level of a content restriction.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FuzzyLevel {
    #[serde(default)]
    pub matching: FuzzyMatch,
    #[serde(default)]
    pub ignore_case: bool,
}

/// The kind of sub-objects a sub-restriction applies to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubObject {
    Recipients,
    Attachments,
}

/// The restriction tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Restriction {
    And(Vec<Restriction>),
    Or(Vec<Restriction>),
    Not(Box<Restriction>),
    Content {
        tag: PropTag,
        value: String,
        #[serde(default)]
        fuzzy: FuzzyLevel,
    },
    Property {
        op: Relop,
        tag: PropTag,
        value: PropValue,
    },
    Bitmask {
        tag: PropTag,
        mask: u32,
        set: bool,
    },
    Exist(PropTag),
    /// Matches if at least one sub-object of the given kind matches
    /// the inner restriction.
    Sub {
        kind: SubObject,
        restriction: Box<Restriction>,
    },
}

impl Restriction {
    /// Build a case-insensitive substring restriction.
    pub fn contains(tag: PropTag, value: impl ToString) -> Self {
        Self::Content {
            tag,
            value: value.to_string(),
            fuzzy: FuzzyLevel {
                matching: FuzzyMatch::Substring,
                ignore_case: true,
            },
        }
    }

    /// Build an equality restriction.
    pub fn eq(tag: PropTag, value: impl Into<PropValue>) -> Self {
        Self::Property {
            op: Relop::Eq,
            tag,
            value: value.into(),
        }
    }

    /// List the property tags needed to evaluate the restriction
    /// against a message row.
    ///
    /// The message flags tag always comes first since it is needed
    /// to compute the unread state of matching messages. Tags only
    /// used inside sub-restrictions are not listed.
    pub fn prop_tags(&self) -> Vec<PropTag> {
        let mut tags = BTreeSet::new();
        self.collect_prop_tags(&mut tags);
        tags.remove(&PropTag::MESSAGE_FLAGS);

        let mut all = Vec::with_capacity(tags.len() + 1);
        all.push(PropTag::MESSAGE_FLAGS);
        all.extend(tags);
        all
    }

    fn collect_prop_tags(&self, tags: &mut BTreeSet<PropTag>) {
        match self {
            Self::And(rs) | Self::Or(rs) => rs.iter().for_each(|r| r.collect_prop_tags(tags)),
            Self::Not(r) => r.collect_prop_tags(tags),
            Self::Content { tag, .. }
            | Self::Property { tag, .. }
            | Self::Bitmask { tag, .. }
            | Self::Exist(tag) => {
                tags.insert(*tag);
            }
            Self::Sub { .. } => (),
        }
    }

    /// List the sub-restrictions of the tree, in depth-first order.
    ///
    /// The position of a sub-restriction in this list is its index
    /// in [`SubRestrictionResults`].
    pub fn sub_restrictions(&self) -> Vec<(SubObject, &Restriction)> {
        let mut subs = Vec::new();
        self.collect_sub_restrictions(&mut subs);
        subs
    }

    fn collect_sub_restrictions<'a>(&'a self, subs: &mut Vec<(SubObject, &'a Restriction)>) {
        match self {
            Self::And(rs) | Self::Or(rs) => {
                rs.iter().for_each(|r| r.collect_sub_restrictions(subs))
            }
            Self::Not(r) => r.collect_sub_restrictions(subs),
            Self::Sub { kind, restriction } => subs.push((*kind, restriction)),
            _ => (),
        }
    }

    /// Return `true` if a sub-restriction contains another
    /// sub-restriction.
    pub fn has_nested_sub_restrictions(&self) -> bool {
        self.sub_restrictions()
            .iter()
            .any(|(_, sub)| !sub.sub_restrictions().is_empty())
    }

    /// Evaluate the restriction against the given row.
    pub fn matches(&self, row: &Row, subs: &SubRestrictionResults) -> bool {
        let mut next_sub = 0;
        self.eval(row, subs, &mut next_sub)
    }

    // Every node is visited, even when the result is already known,
    // so that sub-restriction indexes stay aligned with
    // `sub_restrictions`.
    fn eval(&self, row: &Row, subs: &SubRestrictionResults, next_sub: &mut usize) -> bool {
        match self {
            Self::And(rs) => rs
                .iter()
                .fold(true, |ok, r| r.eval(row, subs, next_sub) && ok),
            Self::Or(rs) => rs
                .iter()
                .fold(false, |ok, r| r.eval(row, subs, next_sub) || ok),
            Self::Not(r) => !r.eval(row, subs, next_sub),
            Self::Content { tag, value, fuzzy } => match row.get(tag) {
                Some(PropValue::String(haystack)) => content_matches(haystack, value, fuzzy),
                _ => false,
            },
            Self::Property { op, tag, value } => row
                .get(tag)
                .and_then(|prop| prop.compare(value))
                .map(|ord| op.accepts(ord))
                .unwrap_or(false),
            Self::Bitmask { tag, mask, set } => match row.get(tag) {
                Some(PropValue::Int(bits)) => ((*bits & i64::from(*mask)) != 0) == *set,
                _ => false,
            },
            Self::Exist(tag) => row.get(tag).is_some(),
            Self::Sub { .. } => {
                let index = *next_sub;
                *next_sub += 1;
                subs.contains(index, row.object)
            }
        }
    }
}

fn content_matches(haystack: &str, needle: &str, fuzzy: &FuzzyLevel) -> bool {
    let (haystack, needle) = if fuzzy.ignore_case {
        (haystack.to_lowercase(), needle.to_lowercase())
    } else {
        (haystack.to_owned(), needle.to_owned())
    };

    match fuzzy.matching {
        FuzzyMatch::FullString => haystack == needle,
        FuzzyMatch::Substring => haystack.contains(&needle),
        FuzzyMatch::Prefix => haystack.starts_with(&needle),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn row() -> Row {
        Row::new(7)
            .with_prop(PropTag::MESSAGE_FLAGS, 0u32)
            .with_prop(PropTag::SUBJECT, "Foobar report")
            .with_prop(PropTag::IMPORTANCE, 2i64)
    }

    #[test]
    fn content() {
        let subs = SubRestrictionResults::default();

        assert!(Restriction::contains(PropTag::SUBJECT, "foo").matches(&row(), &subs));
        assert!(!Restriction::contains(PropTag::SUBJECT, "baz").matches(&row(), &subs));
        assert!(!Restriction::contains(PropTag::BODY, "foo").matches(&row(), &subs));

        let case_sensitive = Restriction::Content {
            tag: PropTag::SUBJECT,
            value: "foo".into(),
            fuzzy: FuzzyLevel {
                matching: FuzzyMatch::Prefix,
                ignore_case: false,
            },
        };
        assert!(!case_sensitive.matches(&row(), &subs));
    }

    #[test]
    fn property_and_bitmask() {
        let subs = SubRestrictionResults::default();

        let high = Restriction::Property {
            op: Relop::Ge,
            tag: PropTag::IMPORTANCE,
            value: PropValue::Int(2),
        };
        assert!(high.matches(&row(), &subs));

        let unread = Restriction::Bitmask {
            tag: PropTag::MESSAGE_FLAGS,
            mask: crate::store::MSGFLAG_READ,
            set: false,
        };
        assert!(unread.matches(&row(), &subs));

        let wrong_type = Restriction::eq(PropTag::IMPORTANCE, "2");
        assert!(!wrong_type.matches(&row(), &subs));
    }

    #[test]
    fn sub_restrictions_keep_their_index() {
        let restriction = Restriction::Or(vec![
            Restriction::Sub {
                kind: SubObject::Recipients,
                restriction: Box::new(Restriction::contains(PropTag::EMAIL_ADDRESS, "alice")),
            },
            Restriction::And(vec![
                Restriction::Exist(PropTag::BODY),
                Restriction::Sub {
                    kind: SubObject::Attachments,
                    restriction: Box::new(Restriction::Exist(PropTag::ATTACH_LONG_FILENAME)),
                },
            ]),
        ]);

        assert_eq!(restriction.sub_restrictions().len(), 2);
        assert!(!restriction.has_nested_sub_restrictions());

        // only the attachment sub-restriction matches, but the And
        // fails because the body is missing
        let subs = SubRestrictionResults::new(vec![BTreeSet::new(), BTreeSet::from([7])]);
        assert!(!restriction.matches(&row(), &subs));

        // the recipient sub-restriction matches
        let subs = SubRestrictionResults::new(vec![BTreeSet::from([7]), BTreeSet::new()]);
        assert!(restriction.matches(&row(), &subs));
    }

    #[test]
    fn nested_sub_restrictions() {
        let restriction = Restriction::Not(Box::new(Restriction::Sub {
            kind: SubObject::Attachments,
            restriction: Box::new(Restriction::Or(vec![
                Restriction::Exist(PropTag::ATTACH_LONG_FILENAME),
                Restriction::Sub {
                    kind: SubObject::Recipients,
                    restriction: Box::new(Restriction::Exist(PropTag::EMAIL_ADDRESS)),
                },
            ])),
        }));

        assert!(restriction.has_nested_sub_restrictions());
    }

    #[test]
    fn prop_tags_start_with_message_flags() {
        let restriction = Restriction::And(vec![
            Restriction::contains(PropTag::SUBJECT, "foo"),
            Restriction::Not(Box::new(Restriction::Exist(PropTag::MESSAGE_FLAGS))),
            Restriction::Sub {
                kind: SubObject::Recipients,
                restriction: Box::new(Restriction::Exist(PropTag::EMAIL_ADDRESS)),
            },
        ]);

        assert_eq!(
            restriction.prop_tags(),
            vec![PropTag::MESSAGE_FLAGS, PropTag::SUBJECT]
        );
    }
}
