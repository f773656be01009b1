//! Compensation runner that reverses a [`Ledger`] on every exit path.
//!
//! Teardown is best effort, not transactional: each reversal is guarded on
//! its own and a failure is recorded before moving on, so one stuck resource
//! never orphans the others. An entry leaves the ledger only once its
//! reversal has been attempted, so a teardown that is dropped part-way leaves
//! the remaining entries for the next pass.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, field::display, info, warn};

use crate::ledger::{Attachment, Ledger, LedgerEntry, Resource};
use crate::service::{CertificateStatus, IdentityService, ServiceError};

/// Cause of a failed reversal.
#[derive(Debug, Error)]
pub enum ReversalError {
    /// The provider rejected the delete or detach call.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// A credential file could not be removed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A reversal that did not complete.
#[derive(Debug, Error)]
#[error("failed to remove {}: {source}", entry.resource)]
pub struct CleanupError {
    /// Entry whose reversal failed.
    pub entry: LedgerEntry,
    /// Provider or filesystem error.
    #[source]
    pub source: ReversalError,
}

/// Outcome of a teardown pass.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Entries reversed successfully, in the order they were processed.
    pub reversed: Vec<LedgerEntry>,
    /// Reversals that failed, in the order they were attempted.
    pub failures: Vec<CleanupError>,
}

impl TeardownReport {
    /// Returns `true` when every entry was reversed.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of reversals attempted.
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.reversed.len() + self.failures.len()
    }

    /// Describes leaked resources, or `None` when teardown was clean.
    #[must_use]
    pub fn leak_summary(&self) -> Option<String> {
        if self.is_clean() {
            return None;
        }
        let details = self
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Some(format!(
            "{} resource(s) may need manual cleanup: {details}",
            self.failures.len()
        ))
    }

    /// Appends the leak summary to `message` when teardown was not clean.
    #[must_use]
    pub fn annotate(&self, message: String) -> String {
        match self.leak_summary() {
            Some(summary) => format!("{message} (teardown also failed: {summary})"),
            None => message,
        }
    }
}

/// Reverses every entry of `ledger` in reverse creation order.
///
/// The ledger is empty afterwards unless the returned future is dropped
/// early; failed entries are reported, not retried.
pub async fn teardown<S>(service: &S, ledger: &mut Ledger) -> TeardownReport
where
    S: IdentityService + ?Sized,
{
    if ledger.is_empty() {
        debug!("ledger empty; nothing to tear down");
        return TeardownReport::default();
    }

    let mut report = TeardownReport::default();
    while let Some(resource) = ledger.last().map(|entry| entry.resource.clone()) {
        let outcome = reverse(service, &resource).await;
        let Some(entry) = ledger.pop_last() else {
            break;
        };
        match outcome {
            Ok(()) => {
                info!(sequence = entry.sequence, resource = display(&entry.resource), "removed");
                report.reversed.push(entry);
            }
            Err(source) => {
                warn!(
                    sequence = entry.sequence,
                    resource = display(&entry.resource),
                    error = display(&source),
                    "removal failed; continuing with remaining resources"
                );
                report.failures.push(CleanupError { entry, source });
            }
        }
    }
    report
}

async fn reverse<S>(service: &S, resource: &Resource) -> Result<(), ReversalError>
where
    S: IdentityService + ?Sized,
{
    match resource {
        Resource::Attachment(Attachment::ThingPrincipal {
            thing_name,
            principal,
        }) => service.detach_thing_principal(thing_name, principal).await?,
        Resource::Attachment(Attachment::Policy {
            policy_name,
            target,
        }) => service.detach_policy(policy_name, target).await?,
        Resource::Certificate { id } => {
            service
                .update_certificate_status(id, CertificateStatus::Inactive)
                .await?;
            service.delete_certificate(id).await?;
        }
        Resource::Thing { name } => service.delete_thing(name).await?,
        Resource::Policy { name } => service.delete_policy(name).await?,
        Resource::CustomMetric { name } => service.delete_custom_metric(name).await?,
        Resource::TemporaryFile { path } => remove_file(path)?,
    }
    Ok(())
}

fn remove_file(path: &Utf8Path) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let Some(file_name) = path.file_name() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} has no file name"),
        ));
    };
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    match dir.remove_file(file_name) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests;
