use ddpm_ood::models::unet_2d::{BlockConfig, UNet2DModel, UNet2DModelConfig};
use ddpm_ood::schedulers::ddpm::NoisePredictor;
use ddpm_ood::utils::load_checkpoint;
use ddpm_ood::{Error, Result};
use std::path::PathBuf;
use tch::{nn, Device, Kind, Tensor};

fn config(base_channels: i64) -> UNet2DModelConfig {
    let bc = |channel_mult, use_attn| BlockConfig { channel_mult, use_attn };
    UNet2DModelConfig {
        base_channels,
        blocks: vec![bc(1, false), bc(2, true)],
        layers_per_block: 1,
        norm_num_groups: 8,
        out_norm_num_groups: 8,
        ..Default::default()
    }
}

fn tmp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ddpm-ood-{}-{name}", std::process::id()))
}

#[test]
fn round_trip() -> Result<()> {
    tch::manual_seed(0);
    let vs = nn::VarStore::new(Device::Cpu);
    let unet = UNet2DModel::new(vs.root(), config(16))?;
    let path = tmp_file("round-trip.ot");
    vs.save(&path)?;

    tch::manual_seed(1);
    let mut vs2 = nn::VarStore::new(Device::Cpu);
    let unet2 = UNet2DModel::new(vs2.root(), config(16))?;
    load_checkpoint(&mut vs2, &path)?;
    std::fs::remove_file(&path).ok();

    let xs = Tensor::randn([1, 1, 8, 8], (Kind::Float, Device::Cpu));
    let ts = Tensor::from_slice(&[12f32]);
    assert!(unet.predict(&xs, &ts)?.equal(&unet2.predict(&xs, &ts)?));
    Ok(())
}

#[test]
fn safetensors_round_trip() -> Result<()> {
    tch::manual_seed(2);
    let vs = nn::VarStore::new(Device::Cpu);
    let unet = UNet2DModel::new(vs.root(), config(16))?;
    let variables = vs.variables();
    let named: Vec<(&str, &Tensor)> =
        variables.iter().map(|(name, tensor)| (name.as_str(), tensor)).collect();
    let path = tmp_file("round-trip.safetensors");
    Tensor::write_safetensors(&named, &path)?;

    tch::manual_seed(3);
    let mut vs2 = nn::VarStore::new(Device::Cpu);
    let unet2 = UNet2DModel::new(vs2.root(), config(16))?;
    load_checkpoint(&mut vs2, &path)?;
    std::fs::remove_file(&path).ok();

    let xs = Tensor::randn([2, 1, 8, 8], (Kind::Float, Device::Cpu));
    let ts = Tensor::from_slice(&[3f32, 40.]);
    assert!(unet.predict(&xs, &ts)?.equal(&unet2.predict(&xs, &ts)?));
    Ok(())
}

#[test]
fn extra_entries_are_rejected() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let _unet = UNet2DModel::new(vs.root(), config(16))?;
    let variables = vs.variables();
    let extra = Tensor::ones([4], (Kind::Float, Device::Cpu));
    let mut named: Vec<(&str, &Tensor)> =
        variables.iter().map(|(name, tensor)| (name.as_str(), tensor)).collect();
    named.push(("head.weight", &extra));
    let path = tmp_file("extra.ot");
    Tensor::save_multi(&named, &path)?;

    let mut vs2 = nn::VarStore::new(Device::Cpu);
    let _unet2 = UNet2DModel::new(vs2.root(), config(16))?;
    let before: Vec<(String, Tensor)> =
        vs2.variables().into_iter().map(|(name, tensor)| (name, tensor.copy())).collect();
    let err = load_checkpoint(&mut vs2, &path);
    std::fs::remove_file(&path).ok();
    match err {
        Err(Error::Configuration(msg)) => assert!(msg.contains("unexpected head.weight")),
        _ => panic!("expected a configuration error, got {err:?}"),
    }
    let after = vs2.variables();
    for (name, tensor) in before.iter() {
        assert!(after[name].equal(tensor), "{name} was modified");
    }
    Ok(())
}

#[test]
fn mismatched_checkpoint_is_rejected() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let _unet = UNet2DModel::new(vs.root(), config(32))?;
    let path = tmp_file("mismatch.ot");
    vs.save(&path)?;

    let mut vs2 = nn::VarStore::new(Device::Cpu);
    let _unet2 = UNet2DModel::new(vs2.root(), config(16))?;
    let before = vs2.variables()["conv_in.weight"].copy();
    let err = load_checkpoint(&mut vs2, &path);
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, Err(Error::Configuration(_))));
    assert!(vs2.variables()["conv_in.weight"].equal(&before));
    Ok(())
}

#[test]
fn partial_checkpoint_is_rejected() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let _unet = UNet2DModel::new(vs.root(), config(16))?;
    let variables = vs.variables();
    let partial: Vec<(&str, &Tensor)> = variables
        .iter()
        .filter(|(name, _)| !name.starts_with("conv_out"))
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();
    let path = tmp_file("partial.ot");
    Tensor::save_multi(&partial, &path)?;

    let mut vs2 = nn::VarStore::new(Device::Cpu);
    let _unet2 = UNet2DModel::new(vs2.root(), config(16))?;
    let err = load_checkpoint(&mut vs2, &path);
    std::fs::remove_file(&path).ok();
    match err {
        Err(Error::Configuration(msg)) => assert!(msg.contains("missing conv_out")),
        _ => panic!("expected a configuration error, got {err:?}"),
    }
    Ok(())
}

#[test]
fn missing_file() {
    let mut vs = nn::VarStore::new(Device::Cpu);
    let err = load_checkpoint(&mut vs, tmp_file("does-not-exist.ot"));
    assert!(matches!(err, Err(Error::Io { .. })));
}
