//! U-Boot environment images.

use std::collections::BTreeMap;
use std::path::Path;

use crate::{bail, Error, IoContext, Result};

/// Size of the CRC32 checksum prefix.
pub const UBOOT_ENV_CRC_SIZE: usize = 4;

/// A U-Boot environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UBootEnv {
    environ: BTreeMap<String, String>,
}

impl UBootEnv {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an environment from a text file with `key=value` lines.
    ///
    /// Blank lines and lines starting with `#` are ignored.
    pub fn load_text(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("File {} does not exist", path.display());
        }
        let text = std::fs::read_to_string(path)
            .context(format!("unable to read {}", path.display()))?;
        Self::parse_text(&text)
    }

    /// Parse an environment from `key=value` lines.
    pub fn parse_text(text: &str) -> Result<Self> {
        let mut env = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!(
                    "Invalid entry in U-Boot environment file (line {})",
                    idx + 1
                );
            };
            env.set(key.trim(), value.trim());
        }
        Ok(env)
    }

    /// Decode an environment from U-Boot's binary representation.
    pub fn from_bytes(data: &[u8]) -> Result<Self, UBootEnvDecodeError> {
        if data.len() < UBOOT_ENV_CRC_SIZE + 1 {
            return Err(UBootEnvDecodeError::InvalidSize(data.len()));
        }
        let (checksum, payload) = data.split_at(UBOOT_ENV_CRC_SIZE);
        let expected = crc32(payload);
        if checksum != expected.as_slice() {
            return Err(UBootEnvDecodeError::InvalidChecksum {
                found: [checksum[0], checksum[1], checksum[2], checksum[3]],
                expected,
            });
        }
        let environ = payload
            .split(|byte| *byte == 0)
            .take_while(|entry| !entry.is_empty())
            .map(|entry| {
                std::str::from_utf8(entry)
                    .map_err(UBootEnvDecodeError::InvalidUtf8)
                    .and_then(|entry| {
                        entry
                            .split_once('=')
                            .ok_or(UBootEnvDecodeError::InvalidEntry)
                    })
                    .map(|(key, value)| (key.to_owned(), value.to_owned()))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(Self { environ })
    }

    /// Set a value of the environment.
    pub fn set(&mut self, key: &str, value: impl AsRef<str>) {
        self.environ
            .insert(key.to_owned(), value.as_ref().to_owned());
    }

    /// Get a value from the environment.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.environ.get(key).map(String::as_str)
    }

    /// Set all values of `other`, overriding existing ones.
    pub fn merge(&mut self, other: &UBootEnv) {
        for (key, value) in &other.environ {
            self.set(key, value);
        }
    }

    /// Encode the environment into a storage area of `size` bytes.
    ///
    /// Entries are sorted by key. The unused space is filled with `0xFF`.
    pub fn to_bytes(&self, size: u64) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        for (key, value) in &self.environ {
            payload.extend(key.as_bytes());
            payload.push(b'=');
            payload.extend(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let used = (UBOOT_ENV_CRC_SIZE + payload.len()) as u64;
        if used > size {
            return Err(Error::UBootEnvOverflow {
                overflow: used - size,
            });
        }
        let size = usize::try_from(size)
            .map_err(|_| Error::config("U-Boot environment is too large"))?;
        payload.resize(size - UBOOT_ENV_CRC_SIZE, 0xFF);
        let mut data = crc32(&payload).to_vec();
        data.extend(payload);
        Ok(data)
    }
}

/// Error decoding an U-Boot environment.
#[derive(Debug, thiserror::Error)]
pub enum UBootEnvDecodeError {
    #[error("invalid size of environment ({0} bytes)")]
    InvalidSize(usize),
    #[error("invalid CRC32 checksum (found: {found:?}, expected: {expected:?})")]
    InvalidChecksum { found: [u8; 4], expected: [u8; 4] },
    #[error("invalid UTF-8 encoding in entry")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("invalid entry without `=`")]
    InvalidEntry,
}

/// Compute the CRC32 checksum of the given data.
fn crc32(data: &[u8]) -> [u8; 4] {
    crc32fast::hash(data).to_le_bytes()
}
