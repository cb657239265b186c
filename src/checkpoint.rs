use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::hyena::Model;
use crate::utils::{read_f32_vec, read_u32, write_f32_slice, write_u32};

/// On-disk layout: `[u32 index_len][JSON index][f32 payload]`, all
/// little-endian. The index maps tensor name to shape and float offset into
/// the payload.
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    shape: Vec<usize>,
    offset: usize,
}

/// Ordered collection of named tensors; the checkpoint and reference-logits
/// file format.
#[derive(Debug, Default)]
pub struct TensorMap {
    entries: BTreeMap<String, ArrayD<f32>>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.entries.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.entries.iter()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut input = BufReader::new(File::open(path)?);
        let index_len = read_u32(&mut input)? as usize;
        let mut raw_index = vec![0u8; index_len];
        input.read_exact(&mut raw_index)?;
        let index: BTreeMap<String, IndexEntry> =
            serde_json::from_slice(&raw_index).map_err(|e| Error::Checkpoint {
                reason: format!("malformed index in {}: {e}", path.display()),
            })?;

        let total_floats = index
            .values()
            .map(|entry| entry.offset + entry.shape.iter().product::<usize>())
            .max()
            .unwrap_or(0);
        let payload = read_f32_vec(&mut input, total_floats)?;

        let mut entries = BTreeMap::new();
        for (name, entry) in index {
            let numel = entry.shape.iter().product::<usize>();
            let end = entry.offset + numel;
            if end > payload.len() {
                return Err(Error::Checkpoint {
                    reason: format!("tensor {name} extends past payload in {}", path.display()),
                });
            }
            let tensor =
                ArrayD::from_shape_vec(IxDyn(&entry.shape), payload[entry.offset..end].to_vec())
                    .map_err(|e| Error::Checkpoint {
                        reason: format!("tensor {name} has inconsistent shape: {e}"),
                    })?;
            entries.insert(name, tensor);
        }
        Ok(Self { entries })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut index = BTreeMap::new();
        let mut offset = 0usize;
        for (name, tensor) in &self.entries {
            index.insert(
                name.clone(),
                IndexEntry {
                    shape: tensor.shape().to_vec(),
                    offset,
                },
            );
            offset += tensor.len();
        }
        let raw_index = serde_json::to_vec(&index).map_err(|e| Error::Checkpoint {
            reason: format!("cannot serialize index: {e}"),
        })?;

        let mut output = BufWriter::new(File::create(path.as_ref())?);
        write_u32(&mut output, raw_index.len() as u32)?;
        output.write_all(&raw_index)?;
        for tensor in self.entries.values() {
            let standard = tensor.as_standard_layout();
            let slice = standard
                .as_slice()
                .expect("standard layout tensor should be contiguous");
            write_f32_slice(&mut output, slice)?;
        }
        Ok(())
    }
}

/// Outcome of reconciling a checkpoint against a model's parameter set.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub matched: Vec<String>,
    pub model_only: Vec<String>,
    pub checkpoint_only: Vec<String>,
}

/// Best-effort merge of checkpoint tensors into the model.
///
/// Every checkpoint name is classified as matched (copied into the model),
/// or checkpoint-only (unknown name or wrong shape, skipped with a warning).
/// Model parameters the checkpoint does not cover keep their initialized
/// values and are listed as model-only. Name mismatches never abort the load.
pub fn apply_checkpoint(model: &mut Model, tensors: &TensorMap) -> LoadReport {
    let mut report = LoadReport::default();
    let model_names = model.parameter_names();

    for (name, value) in tensors.iter() {
        if !model_names.iter().any(|n| n == name) {
            warn!(name = %name, "checkpoint tensor has no model counterpart, skipping");
            report.checkpoint_only.push(name.clone());
            continue;
        }
        match model.set_parameter(name, value.clone()) {
            Ok(()) => report.matched.push(name.clone()),
            Err(e) => {
                warn!(name = %name, error = %e, "checkpoint tensor rejected, skipping");
                report.checkpoint_only.push(name.clone());
            }
        }
    }
    for name in model_names {
        if tensors.get(&name).is_none() {
            report.model_only.push(name);
        }
    }

    info!(
        matched = report.matched.len(),
        model_only = report.model_only.len(),
        checkpoint_only = report.checkpoint_only.len(),
        "checkpoint reconciled"
    );
    report
}

/// Loads a reference logits tensor: a container holding either a single
/// tensor or one named `logits`.
pub fn load_reference_logits<P: AsRef<Path>>(path: P) -> Result<ArrayD<f32>> {
    let tensors = TensorMap::load(path.as_ref())?;
    if tensors.len() == 1 {
        let tensor = tensors
            .iter()
            .next()
            .map(|(_, t)| t.clone())
            .expect("single-entry map has an entry");
        return Ok(tensor);
    }
    tensors
        .get("logits")
        .cloned()
        .ok_or_else(|| Error::Checkpoint {
            reason: format!(
                "{} holds {} tensors and none is named \"logits\"",
                path.as_ref().display(),
                tensors.len()
            ),
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::ArrayD;

    fn tensor(shape: &[usize], start: f32) -> ArrayD<f32> {
        let numel: usize = shape.iter().product();
        ArrayD::from_shape_vec(
            IxDyn(shape),
            (0..numel).map(|i| start + i as f32).collect(),
        )
        .unwrap()
    }

    #[test]
    fn save_load_round_trip() {
        let dir = std::env::temp_dir().join("hyena_rs_checkpoint_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("round_trip.bin");

        let mut tensors = TensorMap::new();
        tensors.insert("alpha", tensor(&[2, 3], 0.0));
        tensors.insert("beta", tensor(&[4], 100.0));
        tensors.save(&path).unwrap();

        let loaded = TensorMap::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("alpha").unwrap(), tensors.get("alpha").unwrap());
        assert_eq!(loaded.get("beta").unwrap(), tensors.get("beta").unwrap());
    }

    #[test]
    fn reference_logits_single_entry() {
        let dir = std::env::temp_dir().join("hyena_rs_checkpoint_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reference.bin");

        let mut tensors = TensorMap::new();
        tensors.insert("anything", tensor(&[8], 0.0));
        tensors.save(&path).unwrap();

        let logits = load_reference_logits(&path).unwrap();
        assert_eq!(logits.shape(), &[8]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(TensorMap::load("/definitely/not/here.bin").is_err());
    }

    #[test]
    fn unknown_names_are_reported_not_fatal() {
        let mut model = crate::hyena::test::perturbed_model();
        let wq_shape = model.parameter_shape("attn.wq").unwrap();

        let mut tensors = TensorMap::new();
        tensors.insert("attn.wq", tensor(&wq_shape, 0.5));
        tensors.insert("optimizer.momentum", tensor(&[3], 0.0));

        let report = apply_checkpoint(&mut model, &tensors);
        assert_eq!(report.matched, vec!["attn.wq"]);
        assert_eq!(report.checkpoint_only, vec!["optimizer.momentum"]);
        assert!(report.model_only.contains(&"token_embedding".to_string()));
        assert_eq!(
            model.parameter_data("attn.wq").unwrap(),
            *tensors.get("attn.wq").unwrap()
        );
    }

    #[test]
    fn shape_mismatch_is_demoted_to_checkpoint_only() {
        let mut model = crate::hyena::test::perturbed_model();
        let mut tensors = TensorMap::new();
        tensors.insert("attn.wq", tensor(&[2, 2], 0.0));

        let report = apply_checkpoint(&mut model, &tensors);
        assert!(report.matched.is_empty());
        assert_eq!(report.checkpoint_only, vec!["attn.wq"]);
    }
}
