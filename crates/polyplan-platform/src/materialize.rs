//! JSON-lines materialization for file-backed channels.
//!
//! One quantum per line, serde's externally tagged representation. Files live
//! in the job's scratch directory and are named after the instance id.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use polyplan_core::channel::ChannelKind;
use polyplan_core::id::InstanceId;
use polyplan_core::types::Quantum;

use crate::error::PlatformError;
use crate::instance::ChannelData;

pub fn instance_path(scratch_dir: &Path, instance: InstanceId) -> PathBuf {
    scratch_dir.join(format!("instance-{}.jsonl", instance.get()))
}

pub fn write_jsonl(path: &Path, items: &[Quantum]) -> Result<(), PlatformError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for q in items {
        serde_json::to_writer(&mut writer, q)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_jsonl(path: &Path) -> Result<Vec<Quantum>, PlatformError> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

/// Store `items` the way `kind` wants them stored.
pub fn materialize(
    items: Arc<Vec<Quantum>>,
    kind: ChannelKind,
    scratch_dir: &Path,
    instance: InstanceId,
) -> Result<ChannelData, PlatformError> {
    if kind.is_file() {
        let path = instance_path(scratch_dir, instance);
        write_jsonl(&path, &items)?;
        Ok(ChannelData::File(path))
    } else {
        Ok(ChannelData::Memory(items))
    }
}
