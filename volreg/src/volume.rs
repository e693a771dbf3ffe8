//! Minimal NRRD volume codec.
//!
//! The pipeline only ever needs voxel access for one purpose: building the
//! per-stage population average. This codec therefore supports exactly the
//! subset the registration engine emits for that path - 3-D, `float`
//! voxels, raw encoding, little-endian - and rejects everything else
//! loudly. General-purpose volume I/O (padding, resampling, other
//! encodings) belongs to the external registration tooling.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

const MAGIC_PREFIX: &str = "NRRD000";

/// Errors from reading or writing a volume file.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("failed to read volume {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write volume {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not an NRRD file")]
    NotNrrd { path: PathBuf },

    #[error("unsupported or malformed NRRD header in {path}: {reason}")]
    Header { path: PathBuf, reason: String },

    #[error("payload size mismatch in {path}: header promises {expected} bytes, found {actual}")]
    PayloadSize {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("voxel count {actual} does not match dimensions {dims:?} ({expected} voxels)")]
    VoxelCount {
        dims: [usize; 3],
        expected: usize,
        actual: usize,
    },
}

/// A 3-D volume of `f32` voxels in x-fastest order.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    dims: [usize; 3],
    voxels: Vec<f32>,
}

impl Volume {
    pub fn new(dims: [usize; 3], voxels: Vec<f32>) -> Result<Self, VolumeError> {
        let expected = dims[0] * dims[1] * dims[2];
        if voxels.len() != expected {
            return Err(VolumeError::VoxelCount {
                dims,
                expected,
                actual: voxels.len(),
            });
        }
        Ok(Self { dims, voxels })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn voxels(&self) -> &[f32] {
        &self.voxels
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Reads a volume, accepting only the codec's NRRD subset.
    pub fn read(path: &Path) -> Result<Self, VolumeError> {
        let bytes = fs::read(path).map_err(|source| VolumeError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        // Header and payload are separated by a blank line.
        let split = find_blank_line(&bytes).ok_or_else(|| VolumeError::NotNrrd {
            path: path.to_path_buf(),
        })?;
        let header = std::str::from_utf8(&bytes[..split]).map_err(|_| VolumeError::NotNrrd {
            path: path.to_path_buf(),
        })?;
        let payload = &bytes[split + 2..];

        let dims = parse_header(header, path)?;
        let expected = dims[0] * dims[1] * dims[2] * 4;
        if payload.len() != expected {
            return Err(VolumeError::PayloadSize {
                path: path.to_path_buf(),
                expected,
                actual: payload.len(),
            });
        }

        let voxels = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Self::new(dims, voxels)
    }

    /// Writes the volume as `NRRD0004` / `float` / raw / little-endian.
    pub fn write(&self, path: &Path) -> Result<(), VolumeError> {
        let header = format!(
            "NRRD0004\n\
             type: float\n\
             dimension: 3\n\
             sizes: {} {} {}\n\
             encoding: raw\n\
             endian: little\n\n",
            self.dims[0], self.dims[1], self.dims[2]
        );

        let mut bytes = Vec::with_capacity(header.len() + self.voxels.len() * 4);
        bytes.extend_from_slice(header.as_bytes());
        for v in &self.voxels {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        fs::write(path, bytes).map_err(|source| VolumeError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn find_blank_line(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\n\n")
}

/// Parses the header lines, enforcing the supported subset, and returns
/// the volume dimensions.
fn parse_header(header: &str, path: &Path) -> Result<[usize; 3], VolumeError> {
    let bad = |reason: String| VolumeError::Header {
        path: path.to_path_buf(),
        reason,
    };

    let mut lines = header.lines();
    match lines.next() {
        Some(magic) if magic.starts_with(MAGIC_PREFIX) => {}
        _ => {
            return Err(VolumeError::NotNrrd {
                path: path.to_path_buf(),
            })
        }
    }

    let mut sizes: Option<[usize; 3]> = None;
    for line in lines {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| bad(format!("malformed field line '{line}'")))?;
        let value = value.trim();
        match key.trim() {
            "type" => {
                if value != "float" && value != "float32" {
                    return Err(bad(format!("unsupported voxel type '{value}'")));
                }
            }
            "dimension" => {
                if value != "3" {
                    return Err(bad(format!("unsupported dimension '{value}'")));
                }
            }
            "encoding" => {
                if value != "raw" {
                    return Err(bad(format!("unsupported encoding '{value}'")));
                }
            }
            "endian" => {
                if value != "little" {
                    return Err(bad(format!("unsupported endianness '{value}'")));
                }
            }
            "sizes" => {
                let parsed: Result<Vec<usize>, _> =
                    value.split_whitespace().map(str::parse).collect();
                let parsed = parsed.map_err(|_| bad(format!("unparseable sizes '{value}'")))?;
                if parsed.len() != 3 {
                    return Err(bad(format!("expected 3 sizes, got {}", parsed.len())));
                }
                sizes = Some([parsed[0], parsed[1], parsed[2]]);
            }
            // Orientation, spacing etc. do not affect voxel-wise averaging.
            _ => {}
        }
    }

    sizes.ok_or_else(|| bad("missing sizes field".to_string()))
}
