use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tch::{nn, Device, Tensor};

/// Where the different parts of the pipeline run and how their random number generator
/// gets seeded. This is passed around explicitly rather than relying on some process
/// wide default device.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    accelerator_device: Device,
    cpu: Vec<String>,
    seed: Option<i64>,
}

impl ExecutionContext {
    /// `cpu` lists the components forced on the cpu, `"all"` forces everything there.
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu, seed: None }
    }

    pub fn cpu() -> Self {
        Self { accelerator_device: Device::Cpu, cpu: vec![], seed: None }
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn device(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }

    /// Re-seeds the torch generator, `offset` is typically the sample index so that
    /// each sample gets reproducible but distinct noise.
    pub fn manual_seed(&self, offset: i64) {
        if let Some(seed) = self.seed {
            tch::manual_seed(seed + offset)
        }
    }
}

fn read_named_tensors(path: &Path, device: Device) -> Result<Vec<(String, Tensor)>> {
    if !path.exists() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        return Err(Error::Io { path: path.to_path_buf(), source });
    }
    let named_tensors = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path)?
            .into_iter()
            .map(|(name, tensor)| (name, tensor.to_device(device)))
            .collect(),
        _ => Tensor::load_multi_with_device(path, device)?,
    };
    Ok(named_tensors)
}

/// Loads all the weights of a var-store from a checkpoint file.
///
/// Unlike `VarStore::load`, the name and shape of every single variable have to match
/// and the checkpoint must not contain any extra entry. All the mismatches are reported
/// at once and the var-store is left untouched when there is any.
pub fn load_checkpoint<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<()> {
    let path = path.as_ref();
    let named_tensors: HashMap<String, Tensor> =
        read_named_tensors(path, vs.device())?.into_iter().collect();
    let mut variables = vs.variables();

    let mut problems = vec![];
    let expected: BTreeSet<&String> = variables.keys().collect();
    let found: BTreeSet<&String> = named_tensors.keys().collect();
    for name in expected.difference(&found) {
        problems.push(format!("missing {name}"));
    }
    for name in found.difference(&expected) {
        problems.push(format!("unexpected {name}"));
    }
    for name in expected.intersection(&found) {
        let (var, src) = (&variables[*name], &named_tensors[*name]);
        if var.size() != src.size() {
            problems.push(format!("shape mismatch for {name}, {:?} <> {:?}", var.size(), src.size()))
        }
    }
    if !problems.is_empty() {
        return Err(Error::config(format!(
            "checkpoint {path:?} does not match the model: {}",
            problems.join(", ")
        )));
    }

    tch::no_grad(|| {
        for (name, var) in variables.iter_mut() {
            var.f_copy_(&named_tensors[name])?
        }
        Ok::<(), tch::TchError>(())
    })?;
    tracing::info!(?path, n_tensors = named_tensors.len(), "loaded checkpoint");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_selection() {
        let ctx = ExecutionContext::new(vec!["unet".to_string()]);
        assert_eq!(ctx.device("unet"), Device::Cpu);
        let ctx = ExecutionContext::new(vec!["all".to_string()]);
        assert_eq!(ctx.device("perceptual"), Device::Cpu);
        assert_eq!(ExecutionContext::cpu().device("unet"), Device::Cpu);
    }

    #[test]
    fn seeding_is_reproducible() {
        let ctx = ExecutionContext::cpu().with_seed(42);
        ctx.manual_seed(3);
        let a = Tensor::randn([4], tch::kind::FLOAT_CPU);
        ctx.manual_seed(3);
        let b = Tensor::randn([4], tch::kind::FLOAT_CPU);
        assert!(a.equal(&b));
    }
}
