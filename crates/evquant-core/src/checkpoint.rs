//! チェックポイントの保存・読み込み
//!
//! バイナリ形式（リトルエンディアン）:
//! `EVQC` | version u32 | iteration u64 | min_val_loss f64 | entries u32 |
//! 各エントリ: name_len u32, name (UTF-8), rank u32, dims u64 × rank,
//! count u64, f32 × count
//!
//! f32/f64 をビット単位で保存するため、inf を含め完全に復元される。

use crate::error::CheckpointError;
use crate::nn::{StateDict, TensorData};
use crate::params::{BEST_CHECKPOINT_NAME, CHECKPOINT_EXTENSION};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_MAGIC: [u8; 4] = *b"EVQC";
pub const CHECKPOINT_VERSION: u32 = 1;

/// 異常ファイルによる巨大確保を防ぐ上限
const MAX_NAME_LEN: usize = 4096;
const MAX_RANK: usize = 8;
/// テンソル本体は宣言された要素数ではなく、実際に読めた分だけ確保していく
const READ_CHUNK: usize = 1 << 16;

/// 保存単位: モデルパラメータと学習状態
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub state_dict: StateDict,
    pub iteration: u64,
    pub min_val_loss: f64,
}

impl Checkpoint {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CheckpointError> {
        w.write_all(&CHECKPOINT_MAGIC)?;
        w.write_u32::<LittleEndian>(CHECKPOINT_VERSION)?;
        w.write_u64::<LittleEndian>(self.iteration)?;
        w.write_f64::<LittleEndian>(self.min_val_loss)?;
        w.write_u32::<LittleEndian>(self.state_dict.len() as u32)?;
        for (name, tensor) in &self.state_dict {
            w.write_u32::<LittleEndian>(name.len() as u32)?;
            w.write_all(name.as_bytes())?;
            w.write_u32::<LittleEndian>(tensor.shape.len() as u32)?;
            for &dim in &tensor.shape {
                w.write_u64::<LittleEndian>(dim as u64)?;
            }
            w.write_u64::<LittleEndian>(tensor.data.len() as u64)?;
            for &v in &tensor.data {
                w.write_f32::<LittleEndian>(v)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, CheckpointError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != CHECKPOINT_MAGIC {
            return Err(CheckpointError::BadMagic(magic));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        let iteration = r.read_u64::<LittleEndian>()?;
        let min_val_loss = r.read_f64::<LittleEndian>()?;
        let entries = r.read_u32::<LittleEndian>()?;

        let mut state_dict = StateDict::new();
        for _ in 0..entries {
            let name_len = r.read_u32::<LittleEndian>()? as usize;
            if name_len > MAX_NAME_LEN {
                return Err(CheckpointError::Corrupt(format!("name length {name_len}")));
            }
            let mut name = vec![0u8; name_len];
            r.read_exact(&mut name)?;
            let name = String::from_utf8(name)
                .map_err(|e| CheckpointError::Corrupt(format!("non UTF-8 name: {e}")))?;

            let rank = r.read_u32::<LittleEndian>()? as usize;
            if rank > MAX_RANK {
                return Err(CheckpointError::Corrupt(format!("rank {rank} for '{name}'")));
            }
            let shape = (0..rank)
                .map(|_| r.read_u64::<LittleEndian>().map(|d| d as usize))
                .collect::<Result<Vec<_>, _>>()?;
            let count = r.read_u64::<LittleEndian>()?;
            let elements = shape.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d as u64));
            if elements != Some(count) {
                return Err(CheckpointError::Corrupt(format!(
                    "'{name}' has shape {shape:?} but {count} values"
                )));
            }
            let data = read_values(r, &name, count)?;
            state_dict.insert(name, TensorData { shape, data });
        }
        Ok(Self { state_dict, iteration, min_val_loss })
    }

    /// 一時ファイルに書いてからリネームし、途中状態のファイルを残さない
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut w = BufWriter::new(tmp.as_file());
            self.write_to(&mut w)?;
            w.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r)
    }
}

fn read_values<R: Read>(r: &mut R, name: &str, count: u64) -> Result<Vec<f32>, CheckpointError> {
    let count = usize::try_from(count)
        .map_err(|_| CheckpointError::Corrupt(format!("'{name}' has {count} values")))?;
    let mut data = Vec::with_capacity(count.min(READ_CHUNK));
    while data.len() < count {
        let start = data.len();
        data.resize(start + (count - start).min(READ_CHUNK), 0.0);
        r.read_f32_into::<LittleEndian>(&mut data[start..]).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CheckpointError::Corrupt(format!("'{name}' truncated: expected {count} values"))
            }
            _ => CheckpointError::Io(e),
        })?;
    }
    Ok(data)
}

/// 最良モデルのパス（上書き保存）
pub fn best_checkpoint_path(log_dir: &Path) -> PathBuf {
    log_dir.join(BEST_CHECKPOINT_NAME)
}

/// 定期保存のパス: `checkpoint_{iteration:05}_{min_val_loss:.4}.ckpt`
pub fn periodic_checkpoint_path(log_dir: &Path, iteration: u64, min_val_loss: f64) -> PathBuf {
    log_dir.join(format!("checkpoint_{iteration:05}_{min_val_loss:.4}.{CHECKPOINT_EXTENSION}"))
}
