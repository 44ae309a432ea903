use std::path::PathBuf;

use crate::tools::Tool;

/// Reasons an image build can fail.
///
/// Every variant is terminal: no output image is guaranteed to exist afterwards
/// and the working directory has already been removed.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A required input file does not exist or is not a regular file.
    #[error("{what} not found: {}", path.display())]
    MissingInput { what: &'static str, path: PathBuf },

    /// A required external program could not be found.
    #[error("required tool not found: {tool} (install {})", tool.package())]
    MissingDependency { tool: Tool },

    /// The image contains neither a GRUB nor an isolinux configuration.
    #[error("no bootloader configuration found in {}", image.display())]
    NoBootConfigFound { image: PathBuf },

    /// The source image could not be read out into the working directory.
    #[error("failed to extract {}", image.display())]
    ExtractionFailed {
        image: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Neither mastering attempt produced a usable image.
    #[error("failed to master {}", output.display())]
    MasteringFailed {
        output: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
