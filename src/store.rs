//! On-disk cache of packed forests.
//!
//! ```text
//! header: MAGIC, version byte, compression byte
//! record: u32 little-endian length, compressed bincode bytes
//! ```
//!
//! Each record is compressed on its own, so the store can be read back one
//! forest at a time.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::config::{self, Fixint, LittleEndian};
use tracing::trace;

use crate::errors::{Error, Result};
use crate::forest::PackedForest;

pub const MAGIC: &[u8] = b"ccgbender forests\n";
pub const VERSION: u8 = 1;
const HEADER_LEN: u64 = MAGIC.len() as u64 + 2;
const ZSTD_LEVEL: i32 = 3;
const XZ_LEVEL: u32 = 6;

fn bincode_config() -> config::Configuration<LittleEndian, Fixint> {
  config::standard().with_little_endian().with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
  None,
  #[default]
  Zstd,
  Xz,
}

impl Compression {
  fn tag(self) -> u8 {
    match self {
      Self::None => 0,
      Self::Zstd => 1,
      Self::Xz => 2,
    }
  }

  fn from_tag(tag: u8) -> Option<Self> {
    match tag {
      0 => Some(Self::None),
      1 => Some(Self::Zstd),
      2 => Some(Self::Xz),
      _ => None,
    }
  }

  fn compress(self, bytes: Vec<u8>) -> Result<Vec<u8>> {
    Ok(match self {
      Self::None => bytes,
      Self::Zstd => zstd::encode_all(bytes.as_slice(), ZSTD_LEVEL)?,
      Self::Xz => {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), XZ_LEVEL);
        encoder.write_all(&bytes)?;
        encoder.finish()?
      }
    })
  }

  fn decompress(self, bytes: Vec<u8>) -> Result<Vec<u8>> {
    Ok(match self {
      Self::None => bytes,
      Self::Zstd => zstd::decode_all(bytes.as_slice())?,
      Self::Xz => {
        let mut out = Vec::new();
        xz2::read::XzDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
        out
      }
    })
  }
}

impl std::str::FromStr for Compression {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "none" => Ok(Self::None),
      "zstd" => Ok(Self::Zstd),
      "xz" => Ok(Self::Xz),
      other => Err(Error::InvalidArgument(format!(
        "unknown compression {} (expected none, zstd or xz)",
        other
      ))),
    }
  }
}

/// Appends forests to a new store file.
pub struct ForestWriter {
  path: PathBuf,
  wtr: BufWriter<File>,
  compression: Compression,
  written: usize,
}

impl ForestWriter {
  pub fn create(path: impl AsRef<Path>, compression: Compression) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let mut wtr = BufWriter::new(File::create(&path)?);
    wtr.write_all(MAGIC)?;
    wtr.write_all(&[VERSION, compression.tag()])?;
    Ok(Self {
      path,
      wtr,
      compression,
      written: 0,
    })
  }

  pub fn write(&mut self, forest: &PackedForest) -> Result<()> {
    let bytes = bincode::encode_to_vec(forest, bincode_config())?;
    let bytes = self.compression.compress(bytes)?;
    let len = u32::try_from(bytes.len())
      .map_err(|_| Error::serialization(&self.path, format!("record of {} bytes", bytes.len())))?;
    self.wtr.write_all(&len.to_le_bytes())?;
    self.wtr.write_all(&bytes)?;
    self.written += 1;
    Ok(())
  }

  /// Flushes the file and returns how many forests were written.
  pub fn finish(mut self) -> Result<usize> {
    self.wtr.flush()?;
    trace!(path = %self.path.display(), forests = self.written, "forest store written");
    Ok(self.written)
  }
}

/// A read cursor over a store file.
pub struct ForestStore {
  path: PathBuf,
  rdr: BufReader<File>,
  compression: Compression,
}

impl ForestStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let mut rdr = BufReader::new(File::open(&path)?);
    let mut magic = vec![0; MAGIC.len()];
    rdr.read_exact(&mut magic)?;
    if magic != MAGIC {
      return Err(Error::serialization(&path, "not a forest store"));
    }
    let mut header = [0u8; 2];
    rdr.read_exact(&mut header)?;
    if header[0] != VERSION {
      return Err(Error::serialization(
        &path,
        format!("unsupported store version {}", header[0]),
      ));
    }
    let compression = Compression::from_tag(header[1])
      .ok_or_else(|| Error::serialization(&path, format!("unknown compression tag {}", header[1])))?;
    Ok(Self {
      path,
      rdr,
      compression,
    })
  }

  pub fn compression(&self) -> Compression {
    self.compression
  }

  /// The next forest, or `None` at the end of the store.
  pub fn next(&mut self) -> Result<Option<PackedForest>> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
      match self.rdr.read(&mut len[filled..]) {
        Ok(0) => break,
        Ok(n) => filled += n,
        Err(e) if e.kind() == ErrorKind::Interrupted => {}
        Err(e) => return Err(e.into()),
      }
    }
    // only a record boundary is a clean end of store
    match filled {
      0 => return Ok(None),
      4 => {}
      n => {
        return Err(Error::serialization(
          &self.path,
          format!("truncated record header: {} of 4 bytes", n),
        ));
      }
    }
    let mut bytes = vec![0; u32::from_le_bytes(len) as usize];
    self
      .rdr
      .read_exact(&mut bytes)
      .map_err(|e| Error::serialization(&self.path, format!("truncated record: {}", e)))?;
    let bytes = self.compression.decompress(bytes)?;
    let (forest, read) = bincode::decode_from_slice(&bytes, bincode_config())?;
    if read != bytes.len() {
      return Err(Error::serialization(&self.path, "trailing bytes in record"));
    }
    Ok(Some(forest))
  }

  /// Rewinds to the first forest.
  pub fn reset(&mut self) -> Result<()> {
    self.rdr.seek(SeekFrom::Start(HEADER_LEN))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::forest::{ForestEdge, ForestNode, ForestRoot};

  fn forest(sentence: u32) -> PackedForest {
    PackedForest {
      sentence,
      nodes: vec![
        ForestNode {
          edges: vec![ForestEdge {
            children: vec![],
            features: vec![0, 3],
            gold: true,
          }],
        },
        ForestNode {
          edges: vec![ForestEdge {
            children: vec![0],
            features: vec![1],
            gold: false,
          }],
        },
      ],
      roots: vec![ForestRoot {
        node: 1,
        features: vec![2],
        gold: false,
      }],
      gold: vec![(0, 1), (3, 1)],
    }
  }

  #[test]
  fn test_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    for compression in [Compression::None, Compression::Zstd, Compression::Xz] {
      let path = dir.path().join("forests");
      let mut writer = ForestWriter::create(&path, compression).unwrap();
      for i in 0..3 {
        writer.write(&forest(i)).unwrap();
      }
      assert_eq!(writer.finish().unwrap(), 3);

      let mut store = ForestStore::open(&path).unwrap();
      assert_eq!(store.compression(), compression);
      for pass in 0..2 {
        let mut seen = Vec::new();
        while let Some(f) = store.next().unwrap() {
          assert_eq!(f, forest(f.sentence));
          seen.push(f.sentence);
        }
        assert_eq!(seen, vec![0, 1, 2], "pass {}", pass);
        store.reset().unwrap();
      }
    }
  }

  #[test]
  fn test_rejects_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk");
    std::fs::write(&path, b"this is not a forest store at all").unwrap();
    assert!(matches!(ForestStore::open(&path), Err(Error::Serialization { .. })));

    let mut bytes = MAGIC.to_vec();
    bytes.extend([VERSION, 9]);
    std::fs::write(&path, bytes).unwrap();
    assert!(matches!(ForestStore::open(&path), Err(Error::Serialization { .. })));
  }

  #[test]
  fn test_truncated_header_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forests");
    let mut writer = ForestWriter::create(&path, Compression::Zstd).unwrap();
    writer.write(&forest(7)).unwrap();
    writer.finish().unwrap();

    let mut store = ForestStore::open(&path).unwrap();
    assert_eq!(store.next().unwrap(), Some(forest(7)));
    assert_eq!(store.next().unwrap(), None);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend([5, 0]);
    std::fs::write(&path, bytes).unwrap();
    let mut store = ForestStore::open(&path).unwrap();
    assert_eq!(store.next().unwrap(), Some(forest(7)));
    assert!(matches!(store.next(), Err(Error::Serialization { .. })));
  }

  #[test]
  fn test_parse_compression() {
    assert_eq!("xz".parse::<Compression>().unwrap(), Compression::Xz);
    assert!("lz4".parse::<Compression>().is_err());
  }
}
