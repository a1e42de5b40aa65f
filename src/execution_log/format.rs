//! Metadata file layout.
//!
//! All integers are big-endian. Strings are a `u16` byte length followed by
//! UTF-8 bytes.
//!
//! ```text
//! u8  version
//! i64 base_timestamp_ms
//! str timezone
//! u32 suite_count
//!   u32 suite_id
//!   u32 thread_count
//!   str inventory
//!   u32 test_count
//!     u32 test_id
//!     str name
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{self, Read, Write};

use super::{ExecutionLogError, FORMAT_VERSION};

/// Identity of one test as recorded in the metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestName {
    pub id: u32,
    pub name: String,
}

/// Per-suite metadata block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteMetadata {
    pub suite_id: u32,
    pub threads: u32,
    pub inventory: String,
    pub tests: Vec<TestName>,
}

/// Self-description of a run, written once before any record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMetadata {
    pub version: u8,
    /// Unix epoch milliseconds that record offsets are relative to
    pub base_timestamp_ms: i64,
    /// IANA timezone id used to render timestamps
    pub timezone: String,
    pub suites: Vec<SuiteMetadata>,
}

impl RunMetadata {
    /// Metadata for a run starting now
    pub fn new(timezone: impl Into<String>, suites: Vec<SuiteMetadata>) -> Self {
        Self {
            version: FORMAT_VERSION,
            base_timestamp_ms: chrono::Utc::now().timestamp_millis(),
            timezone: timezone.into(),
            suites,
        }
    }

    pub fn with_base_timestamp(mut self, base_timestamp_ms: i64) -> Self {
        self.base_timestamp_ms = base_timestamp_ms;
        self
    }

    pub fn test_name(&self, suite_id: u32, test_id: u32) -> Option<&str> {
        self.suites
            .iter()
            .find(|s| s.suite_id == suite_id)?
            .tests
            .iter()
            .find(|t| t.id == test_id)
            .map(|t| t.name.as_str())
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<(), ExecutionLogError> {
        out.write_u8(self.version)?;
        out.write_i64::<BigEndian>(self.base_timestamp_ms)?;
        write_str(out, &self.timezone)?;
        out.write_u32::<BigEndian>(len_u32(self.suites.len(), "suites")?)?;
        for suite in &self.suites {
            out.write_u32::<BigEndian>(suite.suite_id)?;
            out.write_u32::<BigEndian>(suite.threads)?;
            write_str(out, &suite.inventory)?;
            out.write_u32::<BigEndian>(len_u32(suite.tests.len(), "tests")?)?;
            for test in &suite.tests {
                out.write_u32::<BigEndian>(test.id)?;
                write_str(out, &test.name)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self, ExecutionLogError> {
        let version = input.read_u8().map_err(truncated)?;
        if version != FORMAT_VERSION {
            return Err(ExecutionLogError::UnsupportedVersion(version));
        }
        let base_timestamp_ms = input.read_i64::<BigEndian>().map_err(truncated)?;
        let timezone = read_str(input)?;

        let suite_count = input.read_u32::<BigEndian>().map_err(truncated)?;
        let mut suites = Vec::new();
        for _ in 0..suite_count {
            let suite_id = input.read_u32::<BigEndian>().map_err(truncated)?;
            let threads = input.read_u32::<BigEndian>().map_err(truncated)?;
            let inventory = read_str(input)?;
            let test_count = input.read_u32::<BigEndian>().map_err(truncated)?;
            let mut tests = Vec::new();
            for _ in 0..test_count {
                let id = input.read_u32::<BigEndian>().map_err(truncated)?;
                let name = read_str(input)?;
                tests.push(TestName { id, name });
            }
            suites.push(SuiteMetadata {
                suite_id,
                threads,
                inventory,
                tests,
            });
        }

        Ok(Self {
            version,
            base_timestamp_ms,
            timezone,
            suites,
        })
    }
}

fn len_u32(len: usize, field: &'static str) -> Result<u32, ExecutionLogError> {
    u32::try_from(len).map_err(|_| ExecutionLogError::FieldTooLong { field, len })
}

fn write_str<W: Write>(out: &mut W, value: &str) -> Result<(), ExecutionLogError> {
    let len = u16::try_from(value.len()).map_err(|_| ExecutionLogError::FieldTooLong {
        field: "string",
        len: value.len(),
    })?;
    out.write_u16::<BigEndian>(len)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(input: &mut R) -> Result<String, ExecutionLogError> {
    let len = input.read_u16::<BigEndian>().map_err(truncated)?;
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|_| ExecutionLogError::Truncated("invalid UTF-8 in metadata"))
}

fn truncated(err: io::Error) -> ExecutionLogError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ExecutionLogError::Truncated("metadata ends early")
    } else {
        ExecutionLogError::Io(err)
    }
}
