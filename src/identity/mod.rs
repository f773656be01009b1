//! Short-lived device identity provisioning.
//!
//! A provisioned identity is a thing with an active certificate attached as
//! its principal, optionally authorised by a dedicated policy, plus the
//! certificate and private key written to local files for the executable
//! under test. Every created resource is recorded in the caller's [`Ledger`]
//! as soon as it exists; when a later step fails the ledger is torn down
//! before the error is returned.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::json;
use thiserror::Error;
use tracing::{field::display, info, warn};
use uuid::Uuid;

use crate::cleanup::teardown;
use crate::ledger::{Attachment, Ledger, Resource};
use crate::service::{CertificateRecord, IdentityService, ServiceError};

/// Local files holding the identity's credential material.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CredentialFiles {
    /// PEM encoded certificate.
    pub certificate: Utf8PathBuf,
    /// PEM encoded private key.
    pub private_key: Utf8PathBuf,
}

/// A provisioned device identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceIdentity {
    /// Registered thing name.
    pub thing_name: String,
    /// Thing ARN.
    pub thing_arn: String,
    /// Certificate identifier.
    pub certificate_id: String,
    /// Certificate ARN, attached as the thing principal.
    pub certificate_arn: String,
    /// Dedicated policy, when policy attachment is enabled.
    pub policy_name: Option<String>,
    /// Credential files on disk.
    pub credentials: CredentialFiles,
}

/// Errors raised while provisioning an identity.
///
/// Every variant except [`ProvisionError::Thing`] is returned after the
/// partially provisioned identity has been rolled back.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Thing creation failed; nothing was created.
    #[error("failed to create thing: {message}")]
    Thing {
        /// Human-readable description of the failure.
        message: String,
        /// Provider error.
        #[source]
        source: ServiceError,
    },
    /// Certificate creation failed.
    #[error("failed to create certificate: {message}")]
    Certificate {
        /// Human-readable description of the failure, including rollback notes.
        message: String,
        /// Provider error.
        #[source]
        source: ServiceError,
    },
    /// Writing credential files failed.
    #[error("failed to write credentials to {path}: {message}")]
    Credentials {
        /// File that could not be written.
        path: Utf8PathBuf,
        /// Human-readable description of the failure, including rollback notes.
        message: String,
    },
    /// Policy creation or attachment failed.
    #[error("failed to authorise certificate: {message}")]
    Policy {
        /// Human-readable description of the failure, including rollback notes.
        message: String,
        /// Provider error.
        #[source]
        source: ServiceError,
    },
    /// Attaching the certificate to the thing failed.
    #[error("failed to attach certificate to thing: {message}")]
    Attachment {
        /// Human-readable description of the failure, including rollback notes.
        message: String,
        /// Provider error.
        #[source]
        source: ServiceError,
    },
}

/// Creates device identities, recording every resource in a ledger.
#[derive(Debug)]
pub struct Provisioner<'a, S: ?Sized> {
    service: &'a S,
    credentials_dir: Utf8PathBuf,
    attach_policy: bool,
}

impl<'a, S> Provisioner<'a, S>
where
    S: IdentityService + ?Sized,
{
    /// Creates a provisioner writing credential files under `credentials_dir`.
    #[must_use]
    pub fn new(service: &'a S, credentials_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            service,
            credentials_dir: credentials_dir.into(),
            attach_policy: false,
        }
    }

    /// Enables creating and attaching a dedicated policy.
    #[must_use]
    pub const fn with_policy(mut self, attach_policy: bool) -> Self {
        self.attach_policy = attach_policy;
        self
    }

    /// Provisions a new identity named `name_prefix` plus a random suffix.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] naming the failed step. By then `ledger`
    /// has been torn down; leaks are noted in the error message.
    pub async fn provision(
        &self,
        ledger: &mut Ledger,
        name_prefix: &str,
    ) -> Result<DeviceIdentity, ProvisionError> {
        let requested = format!("{name_prefix}{}", Uuid::new_v4().simple());
        let thing = self
            .service
            .create_thing(&requested)
            .await
            .map_err(|source| ProvisionError::Thing {
                message: source.to_string(),
                source,
            })?;
        ledger.record(Resource::Thing {
            name: thing.thing_name.clone(),
        });
        info!(thing = display(&thing.thing_name), "thing created");

        let certificate = match self.service.create_keys_and_certificate().await {
            Ok(certificate) => certificate,
            Err(source) => {
                let message = self.rollback(ledger, source.to_string()).await;
                return Err(ProvisionError::Certificate { message, source });
            }
        };
        ledger.record(Resource::Certificate {
            id: certificate.certificate_id.clone(),
        });
        info!(certificate = display(&certificate.certificate_id), "certificate created");

        let credentials = match self.write_credentials(ledger, &thing.thing_name, &certificate) {
            Ok(credentials) => credentials,
            Err((path, err)) => {
                let message = self.rollback(ledger, err.to_string()).await;
                return Err(ProvisionError::Credentials { path, message });
            }
        };

        let policy_name = if self.attach_policy {
            match self
                .authorise(ledger, &thing.thing_name, &thing.thing_arn, &certificate)
                .await
            {
                Ok(name) => Some(name),
                Err(source) => {
                    let message = self.rollback(ledger, source.to_string()).await;
                    return Err(ProvisionError::Policy { message, source });
                }
            }
        } else {
            None
        };

        if let Err(source) = self
            .service
            .attach_thing_principal(&thing.thing_name, &certificate.certificate_arn)
            .await
        {
            let message = self.rollback(ledger, source.to_string()).await;
            return Err(ProvisionError::Attachment { message, source });
        }
        ledger.record(Resource::Attachment(Attachment::ThingPrincipal {
            thing_name: thing.thing_name.clone(),
            principal: certificate.certificate_arn.clone(),
        }));
        info!(thing = display(&thing.thing_name), "certificate attached");

        Ok(DeviceIdentity {
            thing_name: thing.thing_name,
            thing_arn: thing.thing_arn,
            certificate_id: certificate.certificate_id,
            certificate_arn: certificate.certificate_arn,
            policy_name,
            credentials,
        })
    }

    fn write_credentials(
        &self,
        ledger: &mut Ledger,
        thing_name: &str,
        certificate: &CertificateRecord,
    ) -> Result<CredentialFiles, (Utf8PathBuf, io::Error)> {
        let dir = Dir::create_ambient_dir_all(&self.credentials_dir, ambient_authority())
            .and_then(|()| Dir::open_ambient_dir(&self.credentials_dir, ambient_authority()))
            .map_err(|err| (self.credentials_dir.clone(), err))?;

        let certificate_path = self
            .credentials_dir
            .join(format!("{thing_name}-certificate.pem.crt"));
        write_private_file(&dir, ledger, &certificate_path, &certificate.certificate_pem)
            .map_err(|err| (certificate_path.clone(), err))?;

        let key_path = self
            .credentials_dir
            .join(format!("{thing_name}-private.pem.key"));
        write_private_file(&dir, ledger, &key_path, &certificate.key_pair.private_key)
            .map_err(|err| (key_path.clone(), err))?;

        Ok(CredentialFiles {
            certificate: certificate_path,
            private_key: key_path,
        })
    }

    async fn authorise(
        &self,
        ledger: &mut Ledger,
        thing_name: &str,
        thing_arn: &str,
        certificate: &CertificateRecord,
    ) -> Result<String, ServiceError> {
        let policy_name = format!("{thing_name}_policy");
        let document = policy_document(thing_arn);
        self.service.create_policy(&policy_name, &document).await?;
        ledger.record(Resource::Policy {
            name: policy_name.clone(),
        });
        self.service
            .attach_policy(&policy_name, &certificate.certificate_arn)
            .await?;
        ledger.record(Resource::Attachment(Attachment::Policy {
            policy_name: policy_name.clone(),
            target: certificate.certificate_arn.clone(),
        }));
        info!(policy = display(&policy_name), "policy attached");
        Ok(policy_name)
    }

    async fn rollback(&self, ledger: &mut Ledger, message: String) -> String {
        let report = teardown(self.service, ledger).await;
        match report.leak_summary() {
            Some(summary) => {
                warn!(summary = display(&summary), "rollback incomplete");
                format!("{message} (rollback also failed: {summary})")
            }
            None => message,
        }
    }
}

/// Policy allowing every IoT action on resources in the thing's account and
/// region.
#[must_use]
pub fn policy_document(thing_arn: &str) -> String {
    let resource = thing_arn
        .rsplit_once(':')
        .map_or_else(|| String::from("*"), |(account, _)| format!("{account}:*"));
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": "iot:*",
            "Resource": resource,
        }],
    })
    .to_string()
}

/// Writes `contents` to a new owner-only file. The path is recorded as soon
/// as the file exists, so a failed write is still removed on teardown.
fn write_private_file(
    dir: &Dir,
    ledger: &mut Ledger,
    path: &Utf8Path,
    contents: &str,
) -> io::Result<()> {
    let name = path.file_name().unwrap_or(path.as_str());
    let mut file = dir.create(name)?;
    ledger.record(Resource::TemporaryFile {
        path: path.to_owned(),
    });
    restrict_permissions(dir, name)?;
    file.write_all(contents.as_bytes())?;
    file.flush()
}

#[cfg(unix)]
fn restrict_permissions(dir: &Dir, name: &str) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let permissions = cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(0o600));
    dir.set_permissions(name, permissions)
}

#[cfg(not(unix))]
const fn restrict_permissions(_dir: &Dir, _name: &str) -> io::Result<()> {
    Ok(())
}
