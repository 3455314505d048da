//! Program loaders. The core never parses an executable format; a loader copies an image into
//! guest memory and reports where execution starts.

use std::path::{Path, PathBuf};

use wear_mem::regions::USER_BASE;
use wear_mem::GuestMemory;

use crate::LoadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry_point: u64,
    /// Shown in logs.
    pub description: String,
}

pub trait ProgramLoader {
    fn load(&self, mem: &mut GuestMemory) -> Result<LoadedImage, LoadError>;
}

/// Raw bytes copied to `load_address`, which is also the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImageLoader {
    pub image: Vec<u8>,
    pub load_address: u64,
}

impl RawImageLoader {
    pub fn new(image: Vec<u8>, load_address: u64) -> Self {
        Self {
            image,
            load_address,
        }
    }
}

impl ProgramLoader for RawImageLoader {
    fn load(&self, mem: &mut GuestMemory) -> Result<LoadedImage, LoadError> {
        copy_image(mem, &self.image, self.load_address)?;
        Ok(LoadedImage {
            entry_point: self.load_address,
            description: format!("raw image ({} bytes)", self.image.len()),
        })
    }
}

/// A flat binary file read from disk, placed like [`RawImageLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatBinaryLoader {
    pub path: PathBuf,
    pub load_address: u64,
}

impl FlatBinaryLoader {
    pub fn new(path: impl AsRef<Path>, load_address: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            load_address,
        }
    }

    /// Loads at [`USER_BASE`].
    pub fn at_user_base(path: impl AsRef<Path>) -> Self {
        Self::new(path, USER_BASE)
    }
}

impl ProgramLoader for FlatBinaryLoader {
    fn load(&self, mem: &mut GuestMemory) -> Result<LoadedImage, LoadError> {
        let image = std::fs::read(&self.path).map_err(|source| LoadError::Io {
            path: self.path.clone(),
            source,
        })?;
        copy_image(mem, &image, self.load_address)?;
        Ok(LoadedImage {
            entry_point: self.load_address,
            description: format!("{} ({} bytes)", self.path.display(), image.len()),
        })
    }
}

fn copy_image(mem: &mut GuestMemory, image: &[u8], addr: u64) -> Result<(), LoadError> {
    if image.is_empty() {
        return Err(LoadError::EmptyImage);
    }
    let len = image.len() as u64;
    if !mem.is_valid_address(addr, len) {
        return Err(LoadError::DoesNotFit { addr, len });
    }
    mem.write_block(addr, image)?;
    Ok(())
}
