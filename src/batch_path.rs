use chrono::{DateTime, Utc};
use slog::{warn, Logger};
use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    iter,
};
use uuid::Uuid;

use crate::{logging::event, DATE_FORMAT};

/// Splits an object key in two parts: the base path with filename, and its
/// file extensions. The extension part includes the leading `.`, and a
/// compound extension like `.batch.avro` is returned whole.
pub fn split_key_extensions(key: &str) -> (&str, &str) {
    key.rmatch_indices(['.', '/'].as_ref())
        // Isolate the last path component by stopping at the first (right-most) '/'
        .take_while(|(_, c)| *c != "/")
        // Pick the last (left-most) '.' as the end of the prefix
        .last()
        .map_or((key, ""), |(i, c)| {
            assert_eq!(c, ".");
            key.split_at(i)
        })
}

/// The identity of a batch, parsed from an object key prefix of the form
/// `{aggregation_id}/YYYY/MM/DD/HH/mm/{batch_id}`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchPath {
    pub aggregation_id: String,
    pub time: DateTime<Utc>,
    pub batch_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchPathParseError {
    #[error("component `{0}` is missing")]
    MissingComponent(&'static str),
    #[error("extra trailing components at the end of path: `{0}`")]
    ExtraComponents(String),
    #[error("failed to parse timestamp (at component {})", .field.unwrap_or("[unknown]"))]
    InvalidTimestamp {
        #[source]
        source: chrono::format::ParseError,
        field: Option<&'static str>,
    },
    #[error("invalid uuid")]
    InvalidUuid(#[source] uuid::Error),
}

impl BatchPath {
    /// Parses a batch path from an object key prefix (an object key with its
    /// extensions already stripped). Rejects keys with missing, malformed or
    /// extra components. Parsing is reversible:
    /// `BatchPath::from_key_prefix(p.key_prefix()) == p`.
    pub fn from_key_prefix(key_prefix: &str) -> Result<Self, BatchPathParseError> {
        use chrono::format::{self, Item, Numeric, Pad, Parsed};
        use BatchPathParseError::*;

        fn text_component<'a>(
            components: &mut impl Iterator<Item = &'a str>,
            component_label: &'static str,
        ) -> Result<&'a str, BatchPathParseError> {
            components.next().ok_or(MissingComponent(component_label))
        }

        fn datetime_component<'a>(
            components: &mut impl Iterator<Item = &'a str>,
            partial_datetime: &mut Parsed,
            numeric_field_type: Numeric,
            component_label: &'static str,
        ) -> Result<(), BatchPathParseError> {
            format::parse(
                partial_datetime,
                text_component(components, component_label)?,
                iter::once(Item::Numeric(numeric_field_type, Pad::None)),
            )
            .map_err(|e| InvalidTimestamp {
                source: e,
                field: Some(component_label),
            })
        }

        let mut components = key_prefix.splitn(8, '/');
        let c = &mut components;

        let aggregation_id = text_component(c, "aggregation_id")?.to_owned();

        let mut partial_datetime = Parsed::new();
        let dt = &mut partial_datetime;
        datetime_component(c, dt, Numeric::Year, "year")?;
        datetime_component(c, dt, Numeric::Month, "month")?;
        datetime_component(c, dt, Numeric::Day, "day")?;
        datetime_component(c, dt, Numeric::Hour, "hour")?;
        datetime_component(c, dt, Numeric::Minute, "minute")?;
        let time = partial_datetime
            .to_datetime_with_timezone(&Utc)
            .map_err(|e| InvalidTimestamp {
                source: e,
                field: None,
            })?;

        let batch_id = text_component(c, "batch_id")?
            .parse()
            .map_err(InvalidUuid)?;

        if let Some(remainder) = components.next() {
            assert!(components.next().is_none());
            return Err(ExtraComponents(remainder.to_owned()));
        }

        Ok(BatchPath {
            aggregation_id,
            time,
            batch_id,
        })
    }

    /// The object key prefix for this batch, without any extension.
    pub fn key_prefix(&self) -> String {
        format!(
            "{}/{}/{}",
            self.aggregation_id,
            self.time.format(DATE_FORMAT),
            self.batch_id
        )
    }
}

impl Display for BatchPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_prefix())
    }
}

impl Ord for BatchPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.batch_id.cmp(&other.batch_id))
    }
}

impl PartialOrd for BatchPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A batch along with the presence of each of its three backing objects. A
/// batch is only eligible for scheduling once the header, the packet file and
/// the signature have all been observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Batch {
    path: BatchPath,
    has_header: bool,
    has_packet_file: bool,
    has_signature: bool,
}

impl Batch {
    fn new(path: BatchPath) -> Batch {
        Batch {
            path,
            has_header: false,
            has_packet_file: false,
            has_signature: false,
        }
    }

    pub fn path(&self) -> &BatchPath {
        &self.path
    }

    pub fn is_complete(&self) -> bool {
        self.has_header && self.has_packet_file && self.has_signature
    }
}

/// Groups object keys by batch and emits the complete batches, sorted
/// ascending by `(time, batch ID)` so that older telemetry is scheduled
/// first. `infix` selects which family of objects is being assembled
/// ("batch", "validity_0" or "validity_1"); keys with any other extension are
/// ignored. Keys whose base cannot be parsed, and batches with one or more
/// objects missing, are logged and excluded.
pub fn assemble_batches(logger: &Logger, keys: &[String], infix: &str) -> Vec<Batch> {
    let header_extension = format!(".{}", infix);
    let packet_file_extension = format!(".{}.avro", infix);
    let signature_extension = format!(".{}.sig", infix);

    let mut batches: HashMap<String, Batch> = HashMap::new();
    for key in keys {
        let (key_prefix, extension) = split_key_extensions(key);
        if !batches.contains_key(key_prefix) {
            let path = match BatchPath::from_key_prefix(key_prefix) {
                Ok(path) => path,
                Err(error) => {
                    warn!(
                        logger, "ignoring object with unparseable key";
                        event::STORAGE_KEY => key,
                        "error" => format!("{:?}", error),
                    );
                    continue;
                }
            };
            batches.insert(key_prefix.to_owned(), Batch::new(path));
        }
        // Unwrap safe per the insert above
        let batch = batches.get_mut(key_prefix).unwrap();
        if extension == header_extension {
            batch.has_header = true;
        } else if extension == packet_file_extension {
            batch.has_packet_file = true;
        } else if extension == signature_extension {
            batch.has_signature = true;
        }
    }

    let mut complete: Vec<Batch> = Vec::with_capacity(batches.len());
    for (_, batch) in batches {
        if !batch.is_complete() {
            warn!(
                logger, "ignoring incomplete batch";
                event::BATCH_ID => batch.path().batch_id.to_string(),
                event::BATCH_DATE => batch.path().time.format(DATE_FORMAT).to_string(),
            );
            continue;
        }
        complete.push(batch);
    }
    complete.sort_by(|a, b| a.path().cmp(b.path()));
    complete
}
