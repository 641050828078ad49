//! Declarative builder for bootable and flashable disk images.
//!
//! An image is described by a [`Label`] (MBR or GPT) holding an ordered set of
//! [`Region`]s. Regions may have fixed or floating starts and carry [`Content`] which
//! knows how to produce its bytes. Building an image is a two-phase process:
//! [`Label::prepare`] resolves sizes and positions and validates the layout, and
//! [`Label::create`] writes the image file.

use std::io;

use thiserror::Error;

pub mod content;
pub mod context;
pub mod disk;
pub mod fakeroot;
pub mod fsutils;
pub mod generator;
pub mod label;
pub mod region;
pub mod size;
pub mod uboot_env;

pub use content::Content;
pub use context::BuildContext;
pub use label::Label;
pub use region::{FsType, Region};
pub use size::SizeType;

/// Error building an image.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration.
    #[error("{0}")]
    Config(String),
    /// Invalid size arithmetic or conversion.
    #[error(transparent)]
    Size(#[from] size::SizeError),
    /// Two regions overlap.
    #[error("Part '{part}' overlaps with '{previous}'")]
    Overlap { part: String, previous: String },
    /// A region with a fixed start ended up at a different position.
    #[error("Part '{part}' starts at {start}, but expected on {expected}")]
    Misplaced {
        part: String,
        start: SizeType,
        expected: SizeType,
    },
    /// The U-Boot environment does not fit into its storage area.
    #[error("U-Boot environment variables overflow storage area by {overflow} bytes")]
    UBootEnvOverflow { overflow: u64 },
    /// An external tool failed.
    #[error("{message}")]
    Tool {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// I/O error.
    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config(message.to_string())
    }

    /// Create an error for a failed external tool.
    pub fn tool(
        message: impl std::fmt::Display,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Tool {
            message: message.to_string(),
            source: Box::new(source),
        }
    }
}

/// Result type of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extension trait for attaching a message to I/O errors.
pub(crate) trait IoContext<T> {
    fn context(self, message: impl std::fmt::Display) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn context(self, message: impl std::fmt::Display) -> Result<T> {
        self.map_err(|source| Error::Io {
            message: message.to_string(),
            source,
        })
    }
}

/// Return early with a configuration error.
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::Error::Config(format!($($args)*)))
    };
}

pub(crate) use bail;
