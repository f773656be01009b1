//! In-memory record of every resource a run has created.
//!
//! Entries are appended only after the corresponding create call succeeded,
//! so the ledger always mirrors what exists remotely and on disk. Walking it
//! in reverse creation order undoes dependent resources safely: attachments
//! are released before the certificate, the certificate before the thing.

use std::fmt;

use camino::Utf8PathBuf;

/// Link between two resources that must be released before either side is
/// deleted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attachment {
    /// Certificate attached to a thing as its principal.
    ThingPrincipal {
        /// Thing the principal is attached to.
        thing_name: String,
        /// Certificate ARN.
        principal: String,
    },
    /// Policy attached to a certificate.
    Policy {
        /// Attached policy.
        policy_name: String,
        /// Certificate ARN the policy is attached to.
        target: String,
    },
}

/// Resource that can be reversed during teardown, holding the minimal key
/// needed to undo its creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    /// Registered thing.
    Thing {
        /// Thing name.
        name: String,
    },
    /// Active certificate.
    Certificate {
        /// Certificate identifier.
        id: String,
    },
    /// Identity policy.
    Policy {
        /// Policy name.
        name: String,
    },
    /// Device defender custom metric.
    CustomMetric {
        /// Metric name.
        name: String,
    },
    /// Local file holding credential material.
    TemporaryFile {
        /// Absolute path of the file.
        path: Utf8PathBuf,
    },
    /// Attachment between two remote resources.
    Attachment(Attachment),
}

/// Discriminant of [`Resource`], used in reports.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// See [`Resource::Thing`].
    Thing,
    /// See [`Resource::Certificate`].
    Certificate,
    /// See [`Resource::Policy`].
    Policy,
    /// See [`Resource::CustomMetric`].
    CustomMetric,
    /// See [`Resource::TemporaryFile`].
    TemporaryFile,
    /// See [`Resource::Attachment`].
    Attachment,
}

impl Resource {
    /// Returns the resource discriminant.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Thing { .. } => ResourceKind::Thing,
            Self::Certificate { .. } => ResourceKind::Certificate,
            Self::Policy { .. } => ResourceKind::Policy,
            Self::CustomMetric { .. } => ResourceKind::CustomMetric,
            Self::TemporaryFile { .. } => ResourceKind::TemporaryFile,
            Self::Attachment(_) => ResourceKind::Attachment,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thing { name } => write!(f, "thing {name}"),
            Self::Certificate { id } => write!(f, "certificate {id}"),
            Self::Policy { name } => write!(f, "policy {name}"),
            Self::CustomMetric { name } => write!(f, "custom metric {name}"),
            Self::TemporaryFile { path } => write!(f, "temporary file {path}"),
            Self::Attachment(Attachment::ThingPrincipal {
                thing_name,
                principal,
            }) => write!(f, "principal {principal} on thing {thing_name}"),
            Self::Attachment(Attachment::Policy {
                policy_name,
                target,
            }) => write!(f, "policy {policy_name} on {target}"),
        }
    }
}

/// A recorded resource with its creation-order sequence number.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LedgerEntry {
    /// Position in creation order, starting at zero.
    pub sequence: u64,
    /// Resource to reverse.
    pub resource: Resource,
}

/// Append-only record of created resources owned by one run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    next_sequence: u64,
}

impl Ledger {
    /// Creates an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Appends `resource` and returns its sequence number.
    pub fn record(&mut self, resource: Resource) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(LedgerEntry { sequence, resource });
        sequence
    }

    /// Iterates entries from the most recently created to the first.
    ///
    /// The iterator is cheap to clone, so it can be restarted without
    /// touching the ledger.
    #[must_use]
    pub fn entries_in_reverse_order(
        &self,
    ) -> impl DoubleEndedIterator<Item = &LedgerEntry> + Clone + '_ {
        self.entries.iter().rev()
    }

    /// Number of entries still recorded.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is left to reverse.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recently recorded entry, if any.
    #[must_use]
    pub(crate) fn last(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }

    /// Removes the most recently recorded entry.
    ///
    /// Sequence numbers keep increasing afterwards so entries recorded later
    /// never collide with removed ones.
    pub(crate) fn pop_last(&mut self) -> Option<LedgerEntry> {
        self.entries.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn populated() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.record(Resource::Thing {
            name: String::from("thing-a"),
        });
        ledger.record(Resource::Certificate {
            id: String::from("cert-a"),
        });
        ledger.record(Resource::Attachment(Attachment::ThingPrincipal {
            thing_name: String::from("thing-a"),
            principal: String::from("arn:cert-a"),
        }));
        ledger
    }

    #[rstest]
    fn record_assigns_increasing_sequence_numbers() {
        let mut ledger = Ledger::new();
        let first = ledger.record(Resource::Policy {
            name: String::from("p"),
        });
        let second = ledger.record(Resource::CustomMetric {
            name: String::from("m"),
        });
        assert_eq!((first, second), (0, 1));
        assert_eq!(ledger.len(), 2);
    }

    #[rstest]
    fn reverse_iteration_is_restartable(populated: Ledger) {
        let iter = populated.entries_in_reverse_order();
        let first_pass: Vec<u64> = iter.clone().map(|entry| entry.sequence).collect();
        let second_pass: Vec<u64> = iter.map(|entry| entry.sequence).collect();
        assert_eq!(first_pass, vec![2, 1, 0]);
        assert_eq!(first_pass, second_pass);
        assert_eq!(populated.len(), 3);
    }

    #[rstest]
    fn pop_last_empties_the_ledger_in_reverse_order(mut populated: Ledger) {
        let kinds: Vec<ResourceKind> = std::iter::from_fn(|| populated.pop_last())
            .map(|entry| entry.resource.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Attachment,
                ResourceKind::Certificate,
                ResourceKind::Thing
            ]
        );
        assert!(populated.is_empty());
        assert!(populated.last().is_none());
    }

    #[rstest]
    fn sequences_continue_after_removal(mut populated: Ledger) {
        while populated.pop_last().is_some() {}
        let next = populated.record(Resource::Thing {
            name: String::from("thing-b"),
        });
        assert_eq!(next, 3);
    }

    #[rstest]
    fn display_names_the_resource() {
        let resource = Resource::Attachment(Attachment::Policy {
            policy_name: String::from("p"),
            target: String::from("arn:cert"),
        });
        assert_eq!(resource.to_string(), "policy p on arn:cert");
    }
}
