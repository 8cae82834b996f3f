use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use rusoto_core::{region::ParseRegionError, Region};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

/// Leaks a string into a `&'static str`. Useful for working around clap 2's
/// appetite for `&str` with names and help text computed at runtime. The
/// binary constructs its argument set exactly once, so the leak is bounded.
pub fn leak_string(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

/// Identity represents a cloud identity: either an AWS IAM role ARN (i.e.
/// "arn:...") or a GCP ServiceAccount (i.e. "foo@bar.com"). An empty or
/// absent identity means the ambient default credential (instance service
/// account on GKE, ~/.aws chain on AWS).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Identity(Option<String>);

impl Identity {
    pub fn none() -> Self {
        Identity(None)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl From<Option<&str>> for Identity {
    fn from(value: Option<&str>) -> Self {
        // An empty string argument is treated the same as an absent one
        match value {
            Some("") | None => Identity(None),
            Some(identity) => Identity(Some(identity.to_owned())),
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(identity) => write!(f, "{}", identity),
            None => write!(f, "default identity"),
        }
    }
}

/// The kind of task queue that tasks are published to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskQueueKind {
    GcpPubSub,
    AwsSns,
}

impl Display for TaskQueueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskQueueKind::GcpPubSub => write!(f, "gcp-pubsub"),
            TaskQueueKind::AwsSns => write!(f, "aws-sns"),
        }
    }
}

impl FromStr for TaskQueueKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gcp-pubsub" => Ok(TaskQueueKind::GcpPubSub),
            "aws-sns" => Ok(TaskQueueKind::AwsSns),
            _ => Err(anyhow!("unknown task queue kind {}", s)),
        }
    }
}

/// An S3 bucket addressed as `s3://{region}/{bucket}[/{key prefix}]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct S3Path {
    pub region: Region,
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum S3PathParseError {
    #[error("Not an S3 path")]
    NoPath,
    #[error("expected `s3://{{region}}/{{bucket name}}[/{{key prefix}}]`")]
    InvalidFormat,
    #[error(transparent)]
    InvalidRegion(#[from] ParseRegionError),
}

impl S3Path {
    /// Appends a trailing '/' to a non-empty key so this path can be combined
    /// with object keys as a directory prefix.
    pub fn ensure_directory_prefix(mut self) -> Self {
        if !self.key.is_empty() && !self.key.ends_with('/') {
            self.key.push('/');
        }
        self
    }
}

impl Display for S3Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s3://{}/{}/{}",
            self.region.name(),
            self.bucket,
            self.key
        )
    }
}

impl FromStr for S3Path {
    type Err = S3PathParseError;

    fn from_str(s: &str) -> Result<Self, S3PathParseError> {
        let without_scheme = s.strip_prefix("s3://").ok_or(S3PathParseError::NoPath)?;

        // A region and a bucket name are required; anything after the bucket
        // is an optional key prefix. Validation of bucket names is left to
        // the Amazon servers.
        let mut components = without_scheme
            .splitn(3, '/')
            .take_while(|component| !component.is_empty());
        let region = Region::from_str(components.next().ok_or(S3PathParseError::InvalidFormat)?)?;
        let bucket = components
            .next()
            .ok_or(S3PathParseError::InvalidFormat)?
            .to_owned();
        let key = components.next().unwrap_or_default().to_owned();

        Ok(S3Path {
            region,
            bucket,
            key,
        })
    }
}

/// A Google Cloud Storage bucket addressed as `gs://{bucket}[/{key prefix}]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GCSPath {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GCSPathParseError {
    #[error("Not a GCS path")]
    NoPath,
    #[error("expected `gs://{{bucket name}}[/{{key prefix}}]`")]
    InvalidFormat,
}

impl GCSPath {
    /// Appends a trailing '/' to a non-empty key so this path can be combined
    /// with object keys as a directory prefix.
    pub fn ensure_directory_prefix(mut self) -> Self {
        if !self.key.is_empty() && !self.key.ends_with('/') {
            self.key.push('/');
        }
        self
    }
}

impl Display for GCSPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for GCSPath {
    type Err = GCSPathParseError;

    fn from_str(s: &str) -> Result<Self, GCSPathParseError> {
        let without_scheme = s.strip_prefix("gs://").ok_or(GCSPathParseError::NoPath)?;

        let mut components = without_scheme
            .splitn(2, '/')
            .take_while(|component| !component.is_empty());
        let bucket = components
            .next()
            .ok_or(GCSPathParseError::InvalidFormat)?
            .to_owned();
        let key = components.next().unwrap_or_default().to_owned();

        Ok(GCSPath { bucket, key })
    }
}

/// A path to a cloud object-storage bucket, dispatched by URL scheme.
#[derive(Clone, Debug, PartialEq)]
pub enum StoragePath {
    GCSPath(GCSPath),
    S3Path(S3Path),
}

impl FromStr for StoragePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<StoragePath> {
        match S3Path::from_str(s) {
            Err(S3PathParseError::NoPath) => {}
            p => return Ok(StoragePath::S3Path(p.context("parsing an S3 path")?)),
        }

        match GCSPath::from_str(s) {
            Err(GCSPathParseError::NoPath) => {}
            p => return Ok(StoragePath::GCSPath(p.context("parsing a GCS path")?)),
        }

        Err(anyhow!(
            "storage path {} is neither an s3:// nor a gs:// URL",
            s
        ))
    }
}

impl Display for StoragePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoragePath::GCSPath(path) => path.fmt(f),
            StoragePath::S3Path(path) => path.fmt(f),
        }
    }
}

impl<'de> Deserialize<'de> for StoragePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A duration given as whole hours, minutes and seconds (e.g. `2h30m15s`),
/// the format this binary's duration flags accept. Convert to a
/// [`chrono::Duration`] with [`to_duration`](DayDuration::to_duration) before
/// doing arithmetic with it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DayDuration {
    hours: u32,
    minutes: u32,
    seconds: u32,
}

impl DayDuration {
    pub fn from_hms(hours: u32, minutes: u32, seconds: u32) -> DayDuration {
        DayDuration {
            hours,
            minutes,
            seconds,
        }
    }

    /// Only the leading non-zero component may exceed its usual range, so
    /// that e.g. `90m` parses but `1h90m` does not.
    pub fn validate(&self) -> Result<(), String> {
        if self.hours != 0 && self.minutes >= 60 {
            return Err("minutes must be less than 60 when hours are given".into());
        }
        if (self.hours != 0 || self.minutes != 0) && self.seconds >= 60 {
            return Err("seconds must be less than 60 when minutes or hours are given".into());
        }
        Ok(())
    }

    pub fn to_duration(&self) -> Duration {
        Duration::hours(self.hours.into())
            + Duration::minutes(self.minutes.into())
            + Duration::seconds(self.seconds.into())
    }
}

impl From<DayDuration> for Duration {
    fn from(d: DayDuration) -> Duration {
        d.to_duration()
    }
}

impl fmt::Display for DayDuration {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.hours != 0 {
            write!(f, "{}h", self.hours)?;
        }
        if self.minutes != 0 {
            write!(f, "{}m", self.minutes)?;
        }
        // The zero duration still has to render as something
        if self.seconds != 0 || (self.hours == 0 && self.minutes == 0) {
            write!(f, "{}s", self.seconds)?;
        }
        Ok(())
    }
}

impl FromStr for DayDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<DayDuration, String> {
        static GRAMMAR: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap());

        let captures = GRAMMAR
            .captures(s)
            .ok_or("expected a duration like 2h30m15s")?;

        let component = |group_index, label| -> Result<u32, String> {
            captures
                .get(group_index)
                .map_or(Ok(0), |digits| u32::from_str(digits.as_str()))
                .map_err(|e| format!("{} component out of range: {}", label, e))
        };

        let duration = DayDuration {
            hours: component(1, "hours")?,
            minutes: component(2, "minutes")?,
            seconds: component(3, "seconds")?,
        };
        duration.validate()?;
        Ok(duration)
    }
}

impl Serialize for DayDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DayDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<DayDuration, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}
