use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::domain::quota::resource::QuotaResource;
use crate::domain::quota::ledger::QuotaUsage;
use crate::domain::utils::id::{HostName, ImageId, InstanceId, ProjectId, SnapshotId, VolumeId};

/// Coarse classification of [`Error`] variants, used to derive the stable
/// caller-facing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    InvalidState,
    OverQuota,
    Conflict,
    Validation,
    ExternalService,
}

impl ErrorKind {
    /// HTTP-style status code a request front end reports for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Configuration => 500,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidState => 409,
            ErrorKind::OverQuota => 403,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::ExternalService => 503,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::OverQuota => "OverQuota",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::ExternalService => "ExternalServiceError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ledger's answer to a reservation that does not fit.
#[derive(Debug, Clone, PartialEq)]
pub struct OverQuotaDetail {
    pub overs: Vec<QuotaResource>,
    pub quotas: BTreeMap<QuotaResource, i64>,
    pub usages: BTreeMap<QuotaResource, QuotaUsage>,
}

impl fmt::Display for OverQuotaDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overs: Vec<&str> = self.overs.iter().map(|r| r.as_str()).collect();
        write!(f, "Quota exceeded for resources: [{}]", overs.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // --- Configuration ---
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    // --- NotFound ---
    #[error("{kind} {id} could not be found.")]
    NotFound { kind: &'static str, id: String },

    // --- InvalidState ---
    #[error("Instance {instance_id} in {attr} {state}. Cannot {method} while the instance is in this state.")]
    InvalidState { instance_id: InstanceId, attr: &'static str, state: String, method: &'static str },

    #[error("Instance {0} is not ready")]
    InstanceNotReady(InstanceId),

    #[error("Migration {migration_id} state of instance {instance_id} is {state}. Cannot {method} while the migration is in this state.")]
    InvalidMigrationState { migration_id: String, instance_id: InstanceId, state: String, method: &'static str },

    // --- OverQuota ---
    #[error("{0}")]
    OverQuota(Box<OverQuotaDetail>),

    #[error("Quota exceeded for {overs}: Requested {req}, but already used {used} of {allowed} {overs}")]
    TooManyInstances { overs: String, req: String, used: String, allowed: String, headroom: Option<i64>, message: String },

    #[error("Maximum number of metadata items exceeds {allowed}")]
    MetadataLimitExceeded { allowed: i64 },

    #[error("Personality file limit exceeded")]
    OnsetFileLimitExceeded,

    #[error("Personality file path too long")]
    OnsetFilePathLimitExceeded,

    #[error("Personality file content too long")]
    OnsetFileContentLimitExceeded,

    #[error("Quota exceeded, too many servers in group")]
    ServerGroupMembersExceeded,

    #[error("Maximum number of ports exceeded")]
    PortLimitExceeded,

    #[error("Quota exceeded, too many security groups.")]
    SecurityGroupLimitExceeded,

    // --- Conflict ---
    #[error("Instance {0} is locked")]
    InstanceLocked(InstanceId),

    #[error("Unexpected task state for instance {instance_id}: expecting {expected} but the actual state is {actual}")]
    UnexpectedTaskState { instance_id: InstanceId, expected: String, actual: String },

    #[error("Unexpected task state for instance {instance_id}: expecting {expected} but the actual state is deleting")]
    UnexpectedDeletingTaskState { instance_id: InstanceId, expected: String },

    #[error("Compute service of {host} is still in use.")]
    ComputeServiceInUse { host: HostName },

    #[error("Security group {name} already exists for project {project_id}.")]
    SecurityGroupExists { project_id: ProjectId, name: String },

    #[error("Instance {0} already exists.")]
    InstanceExists(InstanceId),

    // --- Validation ---
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("When resizing, instances must change flavor!")]
    CannotResizeToSameFlavor,

    #[error("Server disk was unable to be resized because: {0}")]
    CannotResizeDisk(String),

    #[error("Instance {instance_id} cannot be rescued: {reason}")]
    InstanceNotRescuable { instance_id: InstanceId, reason: String },

    #[error("Block Device Mapping is Invalid: {0}")]
    InvalidBdm(String),

    #[error("Block Device Mapping is Invalid: Boot sequence for the instance and image/block device mapping combination is not valid.")]
    InvalidBdmBootSequence,

    #[error("Block Device Mapping is Invalid: failed to get image {0}.")]
    InvalidBdmImage(ImageId),

    #[error("Block Device Mapping is Invalid: failed to get volume {volume_id}: {reason}")]
    InvalidBdmVolume { volume_id: VolumeId, reason: String },

    #[error("Block Device Mapping is Invalid: failed to get snapshot {0}.")]
    InvalidBdmSnapshot(SnapshotId),

    #[error("Ephemeral disks requested are larger than the instance type allows.")]
    InvalidBdmEphemeralSize,

    #[error("Swap drive requested is larger than instance type allows.")]
    InvalidBdmSwapSize,

    #[error("Block Device Mapping is Invalid: {0}")]
    InvalidBdmFormat(String),

    #[error("Block Device Mapping is Invalid: You specified more local devices than the limit allows")]
    InvalidBdmLocalsLimit,

    #[error("Block Device {0} is not bootable.")]
    InvalidBdmVolumeNotBootable(VolumeId),

    #[error("User data too large. User data must be no larger than {maxsize} bytes once base64 encoded. Your data is {length} bytes")]
    InstanceUserDataTooLarge { length: usize, maxsize: usize },

    #[error("User data needs to be valid base 64.")]
    InstanceUserDataMalformed,

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid metadata size: {0}")]
    InvalidMetadataSize(String),

    #[error("Image {0} is not active.")]
    ImageNotActive(ImageId),

    #[error("Flavor's memory is too small for requested image.")]
    FlavorMemoryTooSmall,

    #[error("Flavor's disk is too small for requested image. Flavor disk is {flavor_size} bytes, image is {image_size} bytes.")]
    FlavorDiskSmallerThanImage { flavor_size: i64, image_size: i64 },

    #[error("Flavor's disk is smaller than the minimum size specified in image metadata. Flavor disk is {flavor_size} bytes, minimum size is {image_min_disk} bytes.")]
    FlavorDiskSmallerThanMinDisk { flavor_size: i64, image_min_disk: i64 },

    #[error("Volume is smaller than the minimum size specified in image metadata. Volume size is {volume_size} bytes, minimum size is {image_min_disk} bytes.")]
    VolumeSmallerThanMinDisk { volume_size: i64, image_min_disk: i64 },

    #[error("Requested image {0} has automatic disk resize disabled.")]
    AutoDiskConfigDisabledByImage(ImageId),

    #[error("Invalid config_drive provided: {0}")]
    ConfigDriveInvalidValue(String),

    #[error("Image's config drive option '{0}' is invalid")]
    InvalidImageConfigDrive(String),

    #[error("Security group {security_group} not found for project {project_id}.")]
    SecurityGroupNotFoundForProject { project_id: ProjectId, security_group: String },

    #[error("The supplied device path ({0}) is invalid.")]
    InvalidDevicePath(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Unknown quota resources {0}.")]
    QuotaResourceUnknown(String),

    // --- ExternalService ---
    #[error("{service} service failed for {resource_id}: {reason}")]
    ExternalService { service: &'static str, resource_id: String, reason: String },
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound { kind, id: id.to_string() }
    }

    pub fn external(service: &'static str, resource_id: impl ToString, reason: impl ToString) -> Self {
        Error::ExternalService { service, resource_id: resource_id.to_string(), reason: reason.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IoError(_) | Error::DeserializationError(_) | Error::ConfigError(_) => ErrorKind::Configuration,

            Error::NotFound { .. } => ErrorKind::NotFound,

            Error::InvalidState { .. } | Error::InstanceNotReady(_) | Error::InvalidMigrationState { .. } => {
                ErrorKind::InvalidState
            }

            Error::OverQuota(_)
            | Error::TooManyInstances { .. }
            | Error::MetadataLimitExceeded { .. }
            | Error::OnsetFileLimitExceeded
            | Error::OnsetFilePathLimitExceeded
            | Error::OnsetFileContentLimitExceeded
            | Error::ServerGroupMembersExceeded
            | Error::PortLimitExceeded
            | Error::SecurityGroupLimitExceeded => ErrorKind::OverQuota,

            Error::InstanceLocked(_)
            | Error::UnexpectedTaskState { .. }
            | Error::UnexpectedDeletingTaskState { .. }
            | Error::ComputeServiceInUse { .. }
            | Error::SecurityGroupExists { .. }
            | Error::InstanceExists(_) => ErrorKind::Conflict,

            Error::ExternalService { .. } => ErrorKind::ExternalService,

            _ => ErrorKind::Validation,
        }
    }

    /// Stable caller-facing code for this error.
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_stable_codes() {
        let locked = Error::InstanceLocked(InstanceId::new("abc"));
        assert_eq!(locked.kind(), ErrorKind::Conflict);
        assert_eq!(locked.status_code(), 409);

        assert_eq!(Error::not_found("Instance", "abc").status_code(), 404);
        assert_eq!(Error::InvalidBdmBootSequence.kind(), ErrorKind::Validation);
        assert_eq!(Error::PortLimitExceeded.kind(), ErrorKind::OverQuota);
        assert_eq!(Error::external("image", "img-1", "timeout").status_code(), 503);
    }

    #[test]
    fn over_quota_names_the_offending_resources() {
        let detail = OverQuotaDetail {
            overs: vec![QuotaResource::Cores, QuotaResource::Ram],
            quotas: BTreeMap::new(),
            usages: BTreeMap::new(),
        };
        let err = Error::OverQuota(Box::new(detail));
        assert_eq!(err.to_string(), "Quota exceeded for resources: [cores, ram]");
    }
}
